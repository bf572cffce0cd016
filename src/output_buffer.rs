//! Coalesces the output of each node into blocks.
//!
//! Nodes print their command output line by line, and the viewers would
//! rather see one block per command. The first line from a node arms a timer
//! for that node; everything the node prints until the timer expires joins
//! the same block. Later lines do not push the deadline back, so no block
//! waits longer than the debounce period.
//!
//! The buffer does not own a clock or a thread. The owner passes in the
//! current time and asks for [`OutputBuffer::next_deadline`] to know how long
//! it may sleep.

use crate::wire::NodeId;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// How long a node must be quiet before its output is flushed, unless
/// configured otherwise.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Pending {
    text: String,
    deadline: Instant,
}

/// A block of output whose timer has expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    /// Node that printed the block
    pub node: NodeId,
    /// The lines, each terminated by `\n`, in arrival order
    pub text: String,
}

/// Per-node pending output, with at most one armed deadline per node.
#[derive(Debug)]
pub struct OutputBuffer {
    debounce: Duration,
    pending: HashMap<NodeId, Pending>,
}

impl OutputBuffer {
    /// An empty buffer flushing `debounce` after each block's first line.
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: HashMap::new(),
        }
    }

    /// Appends a line of `node`'s output. Returns `true` if this line armed a
    /// new timer, `false` if it joined a block that was already pending.
    pub fn push(&mut self, node: &str, line: &str, now: Instant) -> bool {
        match self.pending.get_mut(node) {
            Some(pending) => {
                pending.text.push_str(line);
                pending.text.push('\n');
                false
            }
            None => {
                let mut text = String::with_capacity(line.len() + 1);
                text.push_str(line);
                text.push('\n');
                self.pending.insert(
                    node.to_owned(),
                    Pending {
                        text,
                        deadline: now + self.debounce,
                    },
                );
                true
            }
        }
    }

    /// The earliest armed deadline, if any block is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Removes and returns every block whose deadline is at or before `now`,
    /// oldest deadline first. Each armed timer fires exactly once.
    pub fn take_due(&mut self, now: Instant) -> Vec<Flushed> {
        let mut due: Vec<(Instant, NodeId)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(node, p)| (p.deadline, node.clone()))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(_, node)| {
                self.pending
                    .remove(&node)
                    .map(|p| Flushed { node, text: p.text })
            })
            .collect()
    }

    #[cfg(test)]
    fn is_pending(&self, node: &str) -> bool {
        self.pending.contains_key(node)
    }

    /// Disarms every timer and drops every pending block.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}
