//! The reporter: watches a testbed's device output and tells the anchor
//! what happened.
//!
//! All of the reporter's state lives in one [`Reporter`], driven by
//! [`run`] from a single thread. Device lines, anchor commands and link
//! changes arrive as [`ReporterEvent`]s; the only other thing that happens is
//! an output block's debounce deadline passing, which the loop handles by
//! waking up in time.

use crate::device_parser::{split_device_line, DeviceParser, ParsedLine};
use crate::output_buffer::OutputBuffer;
use crate::wire::{CommandRequest, Outbox, ReporterMessage};
use log::{debug, info, warn};
use std::{
    io,
    sync::mpsc::{Receiver, RecvTimeoutError, Sender},
    time::{Duration, Instant},
};

/// Everything the reporter's event loop reacts to.
#[derive(Debug)]
pub enum ReporterEvent {
    /// One line of device output
    Device(String),
    /// The device stream ended, with the error that ended it if any
    DeviceClosed(Option<io::Error>),
    /// The anchor link came up
    LinkUp,
    /// The anchor link went down
    LinkDown,
    /// The anchor relayed a command from a viewer
    Command(CommandRequest),
}

/// The reporter's state: one parser and one output buffer shared by all
/// nodes, plus the outbound side of the anchor link.
pub struct Reporter<O> {
    parser: DeviceParser,
    buffer: OutputBuffer,
    anchor: O,
    online: bool,
}

impl<O: Outbox<ReporterMessage>> Reporter<O> {
    /// A reporter that starts out offline.
    pub fn new(anchor: O, debounce: Duration) -> Self {
        Self {
            parser: DeviceParser::new(),
            buffer: OutputBuffer::new(debounce),
            anchor,
            online: false,
        }
    }

    fn send(&mut self, msg: ReporterMessage) {
        if let Err(error) = self.anchor.post(&msg) {
            warn!("Failed to report {:?}: {}", msg, error);
        }
    }

    /// Handles one line of device output.
    ///
    /// Tagged events go out immediately. Everything else, dump lines
    /// included, is buffered until the node has been quiet for the debounce
    /// period.
    pub fn on_device_line(&mut self, line: &str, now: Instant) {
        debug!("DEVICE: {}", line);
        if !self.online {
            debug!("Not connected to the anchor - ignoring incoming line");
            return;
        }

        let Some(device_line) = split_device_line(line) else {
            debug!("Ignoring line without node id: {:?}", line);
            return;
        };

        match self.parser.feed(device_line.node, device_line.output) {
            ParsedLine::Tagged(event) => self.send(ReporterMessage::Rtv(event)),
            ParsedLine::MalformedTag => debug!("Dropping malformed tagged line: {:?}", line),
            ParsedLine::Ifconfig(_) | ParsedLine::Fib(_) | ParsedLine::Plain => {
                self.buffer.push(device_line.node, line, now);
            }
        }
    }

    /// Flushes every block whose deadline has passed: first the raw output,
    /// then the record of the dump the node was in, if any.
    pub fn on_tick(&mut self, now: Instant) {
        for flushed in self.buffer.take_due(now) {
            self.send(ReporterMessage::CommandOutput {
                output: flushed.text,
            });
            if let Some(record) = self.parser.flush(&flushed.node) {
                self.send(record);
            }
        }
    }

    /// The link is up; start reporting.
    pub fn on_link_up(&mut self) {
        self.online = true;
    }

    /// The link is down. Pending blocks and half-read dumps are dropped, so
    /// nothing from before the outage reaches the next session.
    pub fn on_link_down(&mut self) {
        self.online = false;
        self.buffer.clear();
        self.parser.reset();
    }

    /// When [`Reporter::on_tick`] next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffer.next_deadline()
    }
}

/// Runs the reporter until the device stream ends. Commands are handed to
/// `commands`, the device's dispatcher.
///
/// Returns the error that ended the device stream, if any.
pub fn run<O: Outbox<ReporterMessage>>(
    events: Receiver<ReporterEvent>,
    mut reporter: Reporter<O>,
    commands: Sender<CommandRequest>,
) -> io::Result<()> {
    loop {
        let event = match reporter.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match events.recv_timeout(wait) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return Ok(()),
                }
            }
            None => match events.recv() {
                Ok(event) => Some(event),
                Err(_) => return Ok(()),
            },
        };

        match event {
            None => {}
            Some(ReporterEvent::Device(line)) => reporter.on_device_line(&line, Instant::now()),
            Some(ReporterEvent::DeviceClosed(None)) => {
                info!("DEVICE: stream closed");
                return Ok(());
            }
            Some(ReporterEvent::DeviceClosed(Some(error))) => return Err(error),
            Some(ReporterEvent::LinkUp) => {
                info!("Let the journalism begin, covering the RIOT - live");
                reporter.on_link_up();
            }
            Some(ReporterEvent::LinkDown) => reporter.on_link_down(),
            Some(ReporterEvent::Command(req)) => {
                if commands.send(req).is_err() {
                    warn!("Command dispatcher is gone, dropping command");
                }
            }
        }

        reporter.on_tick(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{IfconfigRecord, RtvEvent};
    use std::{
        sync::mpsc::{channel, Receiver},
        thread,
    };

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn online_reporter() -> (Reporter<Sender<ReporterMessage>>, Receiver<ReporterMessage>) {
        let (tx, rx) = channel();
        let mut reporter = Reporter::new(tx, ms(200));
        reporter.on_link_up();
        (reporter, rx)
    }

    #[test]
    fn debounced_output_is_one_block() {
        let (mut reporter, rx) = online_reporter();
        let t0 = Instant::now();
        reporter.on_device_line("1;m3-1;line one", t0);
        reporter.on_device_line("2;m3-1;line two", t0 + ms(50));
        reporter.on_device_line("3;m3-1;line three", t0 + ms(100));

        reporter.on_tick(t0 + ms(199));
        assert!(rx.try_recv().is_err());

        reporter.on_tick(t0 + ms(200));
        let sent: Vec<ReporterMessage> = rx.try_iter().collect();
        assert_eq!(
            sent,
            vec![ReporterMessage::CommandOutput {
                output: "1;m3-1;line one\n2;m3-1;line two\n3;m3-1;line three\n".to_owned(),
            }]
        );
    }

    #[test]
    fn tagged_lines_bypass_the_buffer() {
        let (mut reporter, rx) = online_reporter();
        let t0 = Instant::now();
        reporter.on_device_line("1;m3-2;RTV|FIB_ROUTE_DEL|2001:db8::1", t0);
        assert_eq!(
            rx.try_recv().unwrap(),
            ReporterMessage::Rtv(RtvEvent::RouteDel {
                node: "m3-2".to_owned(),
                dst: "2001:db8::1".to_owned(),
                next_hop: None,
            })
        );
        assert_eq!(reporter.next_deadline(), None);

        reporter.on_device_line("1;m3-2;RTV|FIB_ROUTE_ADD", t0);
        assert!(rx.try_recv().is_err());
        assert_eq!(reporter.next_deadline(), None);
    }

    #[test]
    fn dump_is_reported_after_its_output() {
        let (mut reporter, rx) = online_reporter();
        let t0 = Instant::now();
        reporter.on_device_line("1;m3-1;> ifconfig", t0);
        reporter.on_device_line("1;m3-1;Iface  7   HWaddr: 0x5c52", t0 + ms(10));
        reporter.on_device_line("1;m3-1;  inet6 addr: fe80::5c52/64  scope: local", t0 + ms(20));
        reporter.on_tick(t0 + ms(200));

        let sent: Vec<ReporterMessage> = rx.try_iter().collect();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], ReporterMessage::CommandOutput { .. }));
        assert_eq!(
            sent[1],
            ReporterMessage::Ifconfig(IfconfigRecord {
                node: "m3-1".to_owned(),
                iface: Some("7".to_owned()),
                addrs: vec!["fe80::5c52/64".to_owned()],
            })
        );

        // The node is idle again: the same pattern is now plain output.
        reporter.on_device_line("1;m3-1;  inet6 addr: fe80::1/64", t0 + ms(300));
        reporter.on_tick(t0 + ms(500));
        let sent: Vec<ReporterMessage> = rx.try_iter().collect();
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn offline_reporter_ignores_the_device() {
        let (tx, rx) = channel();
        let mut reporter = Reporter::new(tx, ms(200));
        let t0 = Instant::now();
        reporter.on_device_line("1;m3-1;RTV|FIB_ROUTE_DEL|::/0", t0);
        reporter.on_device_line("1;m3-1;hello", t0);
        assert_eq!(reporter.next_deadline(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn link_loss_cancels_pending_flushes() {
        let (mut reporter, rx) = online_reporter();
        let t0 = Instant::now();
        reporter.on_device_line("1;m3-1;> fibroute", t0);
        reporter.on_device_line("1;m3-1;::/0  0x0003  fe80::1  0x0003  NEVER  7", t0);
        reporter.on_link_down();
        reporter.on_link_up();
        reporter.on_tick(t0 + ms(1000));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn run_loop_flushes_and_forwards_commands() {
        let (events_tx, events_rx) = channel();
        let (out_tx, out_rx) = channel();
        let (cmd_tx, cmd_rx) = channel();
        let reporter = Reporter::new(out_tx, ms(30));

        let handle = thread::spawn(move || run(events_rx, reporter, cmd_tx));

        events_tx.send(ReporterEvent::LinkUp).unwrap();
        events_tx
            .send(ReporterEvent::Device("1;m3-1;hello".to_owned()))
            .unwrap();
        let req = CommandRequest {
            nodes: vec![],
            cmd: "ps".to_owned(),
        };
        events_tx.send(ReporterEvent::Command(req.clone())).unwrap();

        assert_eq!(
            out_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ReporterMessage::CommandOutput {
                output: "1;m3-1;hello\n".to_owned(),
            }
        );
        assert_eq!(cmd_rx.recv_timeout(Duration::from_secs(5)).unwrap(), req);

        events_tx.send(ReporterEvent::DeviceClosed(None)).unwrap();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn run_loop_reports_device_failure() {
        let (events_tx, events_rx) = channel();
        let (out_tx, _out_rx) = channel();
        let (cmd_tx, _cmd_rx) = channel();
        let reporter = Reporter::new(out_tx, ms(30));

        events_tx
            .send(ReporterEvent::DeviceClosed(Some(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "unplugged",
            ))))
            .unwrap();
        let result = run(events_rx, reporter, cmd_tx);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
