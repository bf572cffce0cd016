//! The anchor's set of connected viewers.

use crate::graph::GraphState;
use crate::wire::{Outbox, ViewerMessage};
use log::{debug, info};
use std::collections::BTreeMap;

/// Identifies one viewer connection for its lifetime.
pub type ViewerId = u64;

/// Where records for one viewer go.
pub type ViewerOutlet = Box<dyn Outbox<ViewerMessage>>;

/// Every viewer currently connected.
#[derive(Default)]
pub struct Viewers {
    outlets: BTreeMap<ViewerId, ViewerOutlet>,
}

impl Viewers {
    /// No viewers yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a viewer and sends it the full graph, before any broadcast can
    /// reach it.
    pub fn join(&mut self, id: ViewerId, mut outlet: ViewerOutlet, graph: &GraphState) {
        let init = ViewerMessage::GraphInit(graph.snapshot());
        if let Err(error) = outlet.post(&init) {
            info!("VIEWER {}: gone before the graph was sent: {}", id, error);
            return;
        }
        info!("VIEWER {}: connected, {} watching", id, self.outlets.len() + 1);
        self.outlets.insert(id, outlet);
    }

    /// Removes a viewer. Unknown ids are ignored.
    pub fn leave(&mut self, id: ViewerId) {
        if self.outlets.remove(&id).is_some() {
            info!("VIEWER {}: disconnected, {} watching", id, self.outlets.len());
        }
    }

    /// Sends `msg` to every viewer. Viewers that can no longer be reached
    /// are dropped.
    pub fn broadcast(&mut self, msg: &ViewerMessage) {
        self.outlets.retain(|id, outlet| match outlet.post(msg) {
            Ok(()) => true,
            Err(error) => {
                debug!("VIEWER {}: dropped: {}", id, error);
                false
            }
        });
    }

    /// Number of viewers.
    pub fn len(&self) -> usize {
        self.outlets.len()
    }

    /// Whether nobody is watching.
    pub fn is_empty(&self) -> bool {
        self.outlets.is_empty()
    }
}
