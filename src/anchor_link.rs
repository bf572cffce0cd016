//! The reporter's connection to the anchor.
//!
//! The link keeps exactly one TCP connection to the anchor and re-dials it
//! forever: right away after the anchor closed the connection cleanly, and
//! after [`RetryPolicy::error_delay`] when connecting or reading failed.
//! Records posted while the link is down are dropped; this is live
//! telemetry, there is nothing to catch up on.
//!
//! Commands coming from the anchor and every change of connectivity are
//! forwarded to the reporter's event loop.

use crate::reporter::ReporterEvent;
use crate::wire::{ControlMessage, FrameReader, FrameWriter, Outbox, ReporterMessage, WireError};
use log::{debug, info, warn};
use std::{
    net::TcpStream,
    sync::{mpsc::Sender, Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Connectivity of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting to dial again
    Disconnected,
    /// Dialing
    Connecting,
    /// Records flow
    Connected,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The anchor closed the stream
    Clean,
    /// Dialing, reading or writing failed
    Error,
}

/// When to dial again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause after a failure
    pub error_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            error_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// The pause before the next dial. There is no back-off and no limit.
    pub fn delay_after(&self, reason: CloseReason) -> Duration {
        match reason {
            CloseReason::Clean => Duration::ZERO,
            CloseReason::Error => self.error_delay,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: LinkState,
    writer: Option<FrameWriter<TcpStream>>,
}

/// Handle to the link. Cloning it is cheap; all clones share the one
/// connection.
#[derive(Debug, Clone)]
pub struct AnchorLink {
    shared: Arc<Mutex<Shared>>,
}

impl AnchorLink {
    /// Starts dialing `addr` on a background thread.
    ///
    /// `greeting`, if given, is the first record sent on every new
    /// connection, before anything else can be posted.
    pub fn connect(
        addr: String,
        greeting: Option<ReporterMessage>,
        policy: RetryPolicy,
        events: Sender<ReporterEvent>,
    ) -> (Self, JoinHandle<()>) {
        let link = Self {
            shared: Arc::new(Mutex::new(Shared {
                state: LinkState::Disconnected,
                writer: None,
            })),
        };

        let worker = link.clone();
        let handle = thread::spawn(move || worker.run(addr, greeting, policy, events));

        (link, handle)
    }

    #[cfg(test)]
    fn state(&self) -> LinkState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A poisoned lock only means another thread panicked mid-write; the
        // state itself is still usable.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: LinkState) {
        let mut shared = self.lock();
        shared.state = state;
        if state != LinkState::Connected {
            shared.writer = None;
        }
    }

    /// Sends the greeting on a freshly dialed stream, then publishes the
    /// stream. Nothing can overtake the greeting because no poster can see
    /// the writer before it has been sent.
    fn establish(
        &self,
        stream: &TcpStream,
        greeting: Option<&ReporterMessage>,
    ) -> Result<(), WireError> {
        let mut writer = FrameWriter::new(stream.try_clone()?);
        if let Some(greeting) = greeting {
            writer.send(greeting)?;
        }

        let mut shared = self.lock();
        shared.writer = Some(writer);
        shared.state = LinkState::Connected;
        Ok(())
    }

    fn run(
        self,
        addr: String,
        greeting: Option<ReporterMessage>,
        policy: RetryPolicy,
        events: Sender<ReporterEvent>,
    ) {
        loop {
            self.set_state(LinkState::Connecting);
            info!("SOCKET: Trying to connect to {}", addr);

            let stream = match TcpStream::connect(&addr) {
                Ok(stream) => stream,
                Err(error) => {
                    self.set_state(LinkState::Disconnected);
                    let delay = policy.delay_after(CloseReason::Error);
                    warn!(
                        "SOCKET: Unable to reach the anchor ({}), will try again in {:?}",
                        error, delay
                    );
                    thread::sleep(delay);
                    continue;
                }
            };

            let reason = match self.establish(&stream, greeting.as_ref()) {
                Ok(()) => {
                    info!("SOCKET: Reporting live from the RIOT");
                    if events.send(ReporterEvent::LinkUp).is_err() {
                        break;
                    }
                    self.pump_commands(stream, &events)
                }
                Err(error) => {
                    warn!("SOCKET: Failed to set up the connection: {}", error);
                    CloseReason::Error
                }
            };

            self.set_state(LinkState::Disconnected);
            if events.send(ReporterEvent::LinkDown).is_err() {
                break;
            }

            let delay = policy.delay_after(reason);
            match reason {
                CloseReason::Clean => {
                    info!("SOCKET: Lost connection to the anchor, will try to call back")
                }
                CloseReason::Error => {
                    warn!("SOCKET: Connection to the anchor failed, will try again in {:?}", delay)
                }
            }
            thread::sleep(delay);
        }

        self.set_state(LinkState::Disconnected);
        info!("SOCKET: reporter gone, link stopped");
    }

    /// Forwards commands until the connection ends.
    fn pump_commands(&self, stream: TcpStream, events: &Sender<ReporterEvent>) -> CloseReason {
        let reader: FrameReader<_, ControlMessage> = FrameReader::new(stream);
        for frame in reader {
            match frame {
                Ok(ControlMessage::Command(req)) => {
                    debug!("COMMAND: {:?} for {:?}", req.cmd, req.nodes);
                    if events.send(ReporterEvent::Command(req)).is_err() {
                        return CloseReason::Clean;
                    }
                }
                Err(error) => {
                    warn!("SOCKET: {}", error);
                    return CloseReason::Error;
                }
            }
        }
        CloseReason::Clean
    }
}

impl Outbox<ReporterMessage> for AnchorLink {
    /// Sends `msg` if connected, and silently drops it otherwise.
    fn post(&mut self, msg: &ReporterMessage) -> Result<(), WireError> {
        let mut shared = self.lock();
        let connected = shared.state == LinkState::Connected;
        let Some(writer) = shared.writer.as_mut().filter(|_| connected) else {
            debug!("Not connected to the anchor, dropping {:?}", msg);
            return Ok(());
        };
        if let Err(error) = writer.send(msg) {
            // The reading side notices the broken stream and re-dials.
            warn!("SOCKET: Failed to send to the anchor: {}", error);
            shared.writer = None;
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CommandRequest, NodeInfo};
    use std::{
        net::TcpListener,
        sync::mpsc::{channel, Receiver},
        time::Instant,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_for(rx: &Receiver<ReporterEvent>, pred: impl Fn(&ReporterEvent) -> bool) {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(event) if pred(&event) => return,
                Ok(_) => continue,
                Err(e) => panic!("event never arrived: {}", e),
            }
        }
    }

    fn wait_until(link: &AnchorLink, state: LinkState) {
        let deadline = Instant::now() + WAIT;
        while link.state() != state {
            assert!(Instant::now() < deadline, "link never became {:?}", state);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(CloseReason::Clean), Duration::ZERO);
        assert_eq!(policy.delay_after(CloseReason::Error), Duration::from_secs(1));
    }

    #[test]
    fn greets_then_relays_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let greeting = ReporterMessage::NodesInfo {
            data: vec![NodeInfo::bare("m3-1")],
        };
        let (tx, rx) = channel();
        let (mut link, _) = AnchorLink::connect(
            addr,
            Some(greeting.clone()),
            RetryPolicy::default(),
            tx,
        );

        let (anchor_side, _) = listener.accept().unwrap();
        wait_for(&rx, |e| matches!(e, ReporterEvent::LinkUp));
        assert_eq!(link.state(), LinkState::Connected);

        let output = ReporterMessage::CommandOutput {
            output: "ok\n".to_owned(),
        };
        link.post(&output).unwrap();

        let mut from_reporter: FrameReader<_, ReporterMessage> =
            FrameReader::new(anchor_side.try_clone().unwrap());
        assert_eq!(from_reporter.next().unwrap().unwrap(), greeting);
        assert_eq!(from_reporter.next().unwrap().unwrap(), output);

        let req = CommandRequest {
            nodes: vec!["m3-1".to_owned()],
            cmd: "ifconfig".to_owned(),
        };
        FrameWriter::new(anchor_side)
            .send(&ControlMessage::Command(req.clone()))
            .unwrap();
        wait_for(&rx, |e| matches!(e, ReporterEvent::Command(r) if *r == req));
    }

    #[test]
    fn redials_after_clean_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = channel();
        let (link, _) = AnchorLink::connect(addr, None, RetryPolicy::default(), tx);

        let (first, _) = listener.accept().unwrap();
        wait_for(&rx, |e| matches!(e, ReporterEvent::LinkUp));
        drop(first);
        wait_for(&rx, |e| matches!(e, ReporterEvent::LinkDown));

        let started = Instant::now();
        let (_second, _) = listener.accept().unwrap();
        wait_for(&rx, |e| matches!(e, ReporterEvent::LinkUp));
        assert!(started.elapsed() < Duration::from_secs(1));
        wait_until(&link, LinkState::Connected);
    }

    #[test]
    fn drops_records_while_disconnected() {
        // Grab a free port, then make sure nobody listens on it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (tx, _rx) = channel();
        let policy = RetryPolicy {
            error_delay: Duration::from_millis(20),
        };
        let (mut link, _) = AnchorLink::connect(addr, None, policy, tx);

        assert_ne!(link.state(), LinkState::Connected);
        let result = link.post(&ReporterMessage::CommandOutput {
            output: "lost\n".to_owned(),
        });
        assert!(result.is_ok());
    }
}
