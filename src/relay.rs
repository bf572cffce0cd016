//! The anchor: one reporter session in, any number of viewers out.
//!
//! Connections are accepted and read on their own threads, and everything
//! they produce is funneled into one channel of [`AnchorEvent`]s. A single
//! thread runs [`run`], which owns the [`Anchor`] and with it the session,
//! the graph and the viewer set. Records from the session are therefore
//! applied and relayed strictly in the order they arrived.
//!
//! Writes go the other way through per-connection writer threads (see
//! [`spawn_writer`]), so a slow viewer never holds up the loop.

use crate::fanout::{ViewerId, ViewerOutlet, Viewers};
use crate::graph::GraphState;
use crate::pump::spawn_pump;
use crate::wire::{
    ControlMessage, FrameReader, FrameWriter, Outbox, ReporterMessage, ViewerMessage,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    collections::VecDeque,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::mpsc::{self, Receiver, Sender},
    thread::{self, JoinHandle},
};

/// Identifies one reporter connection for its lifetime.
pub type PeerId = u64;

/// Where commands for one reporter go.
pub type ReporterOutlet = Box<dyn Outbox<ControlMessage>>;

/// Everything the anchor's event loop reacts to.
pub enum AnchorEvent {
    /// A reporter connected
    ReporterConnected {
        /// Connection id
        peer: PeerId,
        /// Remote address, for the logs
        addr: SocketAddr,
        /// Commands for this reporter
        outlet: ReporterOutlet,
    },
    /// A reporter sent a record
    Reporter {
        /// Connection id
        peer: PeerId,
        /// The record
        msg: ReporterMessage,
    },
    /// A reporter's connection ended
    ReporterClosed {
        /// Connection id
        peer: PeerId,
    },
    /// A viewer connected
    ViewerConnected {
        /// Connection id
        viewer: ViewerId,
        /// Records for this viewer
        outlet: ViewerOutlet,
    },
    /// A viewer sent a request
    Viewer {
        /// Connection id
        viewer: ViewerId,
        /// The request
        msg: ControlMessage,
    },
    /// A viewer's connection ended
    ViewerClosed {
        /// Connection id
        viewer: ViewerId,
    },
}

struct Session {
    peer: PeerId,
    addr: SocketAddr,
    outlet: ReporterOutlet,
    /// Last `nodesInfo` received while waiting, replayed on promotion
    inventory: Option<ReporterMessage>,
}

/// All of the anchor's state.
#[derive(Default)]
pub struct Anchor {
    session: Option<Session>,
    pending: VecDeque<Session>,
    graph: GraphState,
    viewers: Viewers,
}

impl Anchor {
    /// An anchor with no reporter and no viewers.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current session's graph.
    pub fn graph(&self) -> &GraphState {
        &self.graph
    }

    /// The connection id of the active reporter.
    pub fn active_reporter(&self) -> Option<PeerId> {
        self.session.as_ref().map(|s| s.peer)
    }

    /// Number of connected viewers.
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Handles one event.
    pub fn handle(&mut self, event: AnchorEvent) {
        match event {
            AnchorEvent::ReporterConnected { peer, addr, outlet } => {
                let session = Session {
                    peer,
                    addr,
                    outlet,
                    inventory: None,
                };
                if self.session.is_some() {
                    info!("REPORTER {} ({}): waiting for the active session to end", peer, addr);
                    self.pending.push_back(session);
                } else {
                    self.start_session(session);
                }
            }
            AnchorEvent::Reporter { peer, msg } => {
                if self.active_reporter() != Some(peer) {
                    self.hold_back(peer, msg);
                    return;
                }
                self.graph.apply(&msg);
                self.viewers.broadcast(&msg.into());
            }
            AnchorEvent::ReporterClosed { peer } => {
                if self.active_reporter() == Some(peer) {
                    info!("REPORTER {}: session over", peer);
                    self.session = None;
                    self.graph.clear();
                    if let Some(next) = self.pending.pop_front() {
                        self.start_session(next);
                    }
                } else {
                    self.pending.retain(|s| s.peer != peer);
                }
            }
            AnchorEvent::ViewerConnected { viewer, outlet } => {
                self.viewers.join(viewer, outlet, &self.graph);
            }
            AnchorEvent::Viewer { viewer, msg } => {
                let Some(session) = self.session.as_mut() else {
                    debug!("VIEWER {}: no reporter, dropping {:?}", viewer, msg);
                    return;
                };
                let ControlMessage::Command(req) = &msg;
                info!("VIEWER {}: command {:?} for {:?}", viewer, req.cmd, req.nodes);
                if let Err(error) = session.outlet.post(&msg) {
                    warn!("REPORTER {}: failed to forward command: {}", session.peer, error);
                }
            }
            AnchorEvent::ViewerClosed { viewer } => self.viewers.leave(viewer),
        }
    }

    /// Records from a waiting reporter are dropped, except its inventory,
    /// which it only sends once per connection.
    fn hold_back(&mut self, peer: PeerId, msg: ReporterMessage) {
        let waiting = self.pending.iter_mut().find(|s| s.peer == peer);
        match (waiting, msg) {
            (Some(session), msg @ ReporterMessage::NodesInfo { .. }) => {
                debug!("REPORTER {}: keeping inventory until the session starts", peer);
                session.inventory = Some(msg);
            }
            (_, msg) => {
                debug!("REPORTER {}: not the active session, dropping {:?}", peer, msg);
            }
        }
    }

    /// A new session always starts from an empty graph, plus whatever
    /// inventory the reporter sent while it waited.
    fn start_session(&mut self, mut session: Session) {
        self.graph.clear();
        info!("REPORTER {} ({}): session started", session.peer, session.addr);
        if let Some(inventory) = session.inventory.take() {
            self.graph.apply(&inventory);
            self.viewers.broadcast(&inventory.into());
        }
        self.session = Some(session);
    }
}

/// Runs the anchor until every event source is gone.
pub fn run(events: Receiver<AnchorEvent>, mut anchor: Anchor) {
    for event in events {
        anchor.handle(event);
    }
    info!("Anchor : terminated.");
}

/// Starts a thread that writes every record it is handed to `stream`, and
/// returns the handle to post records with. Once writing fails the thread
/// stops, and posting to the handle fails from then on.
pub fn spawn_writer<M>(name: String, stream: TcpStream) -> (Sender<M>, JoinHandle<()>)
where
    M: Serialize + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<M>();
    let handle = thread::spawn(move || {
        let mut writer = FrameWriter::new(stream);
        for msg in rx {
            if let Err(error) = writer.send(&msg) {
                debug!("{} : write failed : {}.", name, error);
                break;
            }
        }
        debug!("{} : writer terminated.", name);
    });
    (tx, handle)
}

/// Accepts reporters on `listener` until the event loop is gone.
pub fn spawn_reporter_listener(
    listener: TcpListener,
    events: Sender<AnchorEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for (peer, stream) in (0..).zip(listener.incoming()) {
            let (stream, addr) = match stream.and_then(|s| {
                let addr = s.peer_addr()?;
                Ok((s, addr))
            }) {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!("Failed to accept a reporter: {}", error);
                    continue;
                }
            };
            let reader = match stream.try_clone() {
                Ok(reader) => reader,
                Err(error) => {
                    warn!("REPORTER {}: unusable connection: {}", peer, error);
                    continue;
                }
            };

            let name = format!("Reporter {}", peer);
            let (outlet, _) = spawn_writer::<ControlMessage>(name.clone(), stream);
            let connected = AnchorEvent::ReporterConnected {
                peer,
                addr,
                outlet: Box::new(outlet),
            };
            if events.send(connected).is_err() {
                break;
            }
            spawn_pump(
                name,
                FrameReader::<_, ReporterMessage>::new(reader),
                events.clone(),
                move |msg| AnchorEvent::Reporter { peer, msg },
                move |_| AnchorEvent::ReporterClosed { peer },
            );
        }
        info!("Reporter listener : terminated.");
    })
}

/// Accepts viewers on `listener` until the event loop is gone.
pub fn spawn_viewer_listener(listener: TcpListener, events: Sender<AnchorEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for (viewer, stream) in (0..).zip(listener.incoming()) {
            let (stream, reader) = match stream.and_then(|s| {
                let reader = s.try_clone()?;
                Ok((s, reader))
            }) {
                Ok(halves) => halves,
                Err(error) => {
                    warn!("Failed to accept a viewer: {}", error);
                    continue;
                }
            };

            let name = format!("Viewer {}", viewer);
            let (outlet, _) = spawn_writer::<ViewerMessage>(name.clone(), stream);
            let connected = AnchorEvent::ViewerConnected {
                viewer,
                outlet: Box::new(outlet),
            };
            if events.send(connected).is_err() {
                break;
            }
            spawn_pump(
                name,
                FrameReader::<_, ControlMessage>::new(reader),
                events.clone(),
                move |msg| AnchorEvent::Viewer { viewer, msg },
                move |_| AnchorEvent::ViewerClosed { viewer },
            );
        }
        info!("Viewer listener : terminated.");
    })
}
