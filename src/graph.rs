//! The anchor's picture of the network.
//!
//! One [`GraphState`] holds every node of the current reporter session with
//! its interface and routing tables. Edges are not stored: a route whose
//! next hop is an address some node owns is an edge from the route's owner
//! to that node, and the [address index](GraphState::resolve) makes that
//! lookup cheap.
//!
//! The address index maps each address, without its `/prefix` suffix, to the
//! nodes that currently have it assigned. It is updated on every interface
//! change and is always exactly the union of all interface tables.

use crate::wire::{
    Edge, FibRecord, GraphSnapshot, IfconfigRecord, NodeId, NodeInfo, NodeView, ReporterMessage,
    Route, RtvEvent,
};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Strips the `/prefix` suffix off an address.
pub fn address_key(addr: &str) -> &str {
    addr.split('/').next().unwrap_or(addr)
}

/// One node of the current session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// The node's id
    pub id: NodeId,
    /// Descriptor from the last `nodesInfo` that listed this node
    pub info: Option<NodeInfo>,
    /// Interface name to assigned addresses
    pub ifconfig: BTreeMap<String, BTreeSet<String>>,
    /// Routing table, in insertion order
    pub fib: Vec<Route>,
}

impl Node {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            ..Default::default()
        }
    }

    fn owns_key(&self, key: &str) -> bool {
        self.ifconfig
            .values()
            .flatten()
            .any(|addr| address_key(addr) == key)
    }

    fn view(&self) -> NodeView {
        NodeView {
            info: self.info.clone().unwrap_or_else(|| NodeInfo::bare(&self.id)),
            ifconfig: self
                .ifconfig
                .iter()
                .map(|(iface, addrs)| (iface.clone(), addrs.iter().cloned().collect()))
                .collect(),
            fib: self.fib.clone(),
        }
    }
}

type AddressIndex = HashMap<String, BTreeSet<NodeId>>;

fn index_add(index: &mut AddressIndex, node: &str, addr: &str) {
    index
        .entry(address_key(addr).to_owned())
        .or_default()
        .insert(node.to_owned());
}

/// Drops `node` as an owner of `addr`'s key, unless the node still has the
/// key assigned elsewhere.
fn index_remove(index: &mut AddressIndex, node: &Node, addr: &str) {
    let key = address_key(addr);
    if node.owns_key(key) {
        return;
    }
    if let Some(owners) = index.get_mut(key) {
        owners.remove(&node.id);
        if owners.is_empty() {
            index.remove(key);
        }
    }
}

/// Nodes, their tables, and the address index, for one reporter session.
#[derive(Debug, Default)]
pub struct GraphState {
    nodes: BTreeMap<NodeId, Node>,
    addr_index: AddressIndex,
}

impl GraphState {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.addr_index.clear();
    }

    /// Whether there is nothing to show.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node with the given id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// The node an address is assigned to. If several nodes claim it, the
    /// one with the smallest id wins.
    pub fn resolve(&self, addr: &str) -> Option<&str> {
        self.addr_index
            .get(address_key(addr))
            .and_then(|owners| owners.iter().next())
            .map(String::as_str)
    }

    fn node_entry<'a>(nodes: &'a mut BTreeMap<NodeId, Node>, id: &str) -> &'a mut Node {
        nodes.entry(id.to_owned()).or_insert_with(|| Node::new(id))
    }

    /// Applies one record from the reporter. Records that carry no state,
    /// like raw command output, leave the graph untouched.
    pub fn apply(&mut self, msg: &ReporterMessage) {
        match msg {
            ReporterMessage::NodesInfo { data } => self.set_nodes_info(data),
            ReporterMessage::Ifconfig(record) => self.replace_ifconfig(record),
            ReporterMessage::Fib(record) => self.replace_fib(record),
            ReporterMessage::Rtv(event) => self.apply_event(event),
            ReporterMessage::CommandOutput { .. } => {}
        }
    }

    fn set_nodes_info(&mut self, data: &[NodeInfo]) {
        for node in self.nodes.values_mut() {
            node.info = None;
        }
        for info in data {
            Self::node_entry(&mut self.nodes, &info.id).info = Some(info.clone());
        }
    }

    /// A dump replaces the whole interface table, not just the one
    /// interface it names.
    fn replace_ifconfig(&mut self, record: &IfconfigRecord) {
        let node = Self::node_entry(&mut self.nodes, &record.node);
        let old = std::mem::take(&mut node.ifconfig);
        for addr in old.values().flatten() {
            index_remove(&mut self.addr_index, node, addr);
        }

        let iface = record.iface.clone().unwrap_or_default();
        let addrs: BTreeSet<String> = record.addrs.iter().cloned().collect();
        for addr in &addrs {
            index_add(&mut self.addr_index, &node.id, addr);
        }
        if !addrs.is_empty() || record.iface.is_some() {
            node.ifconfig.insert(iface, addrs);
        }
    }

    fn replace_fib(&mut self, record: &FibRecord) {
        Self::node_entry(&mut self.nodes, &record.node).fib = record.entries.clone();
    }

    fn apply_event(&mut self, event: &RtvEvent) {
        let node = Self::node_entry(&mut self.nodes, event.node());
        match event {
            RtvEvent::AddrAdd { iface, ipaddr, .. } => {
                node.ifconfig
                    .entry(iface.clone())
                    .or_default()
                    .insert(ipaddr.clone());
                index_add(&mut self.addr_index, &node.id, ipaddr);
            }
            RtvEvent::AddrDel { iface, ipaddr, .. } => {
                let key = address_key(ipaddr);
                let Some(addrs) = node.ifconfig.get_mut(iface) else {
                    debug!("{} has no interface {}, ignoring removal", node.id, iface);
                    return;
                };
                addrs.retain(|addr| address_key(addr) != key);
                if addrs.is_empty() {
                    node.ifconfig.remove(iface);
                }
                index_remove(&mut self.addr_index, node, ipaddr);
            }
            RtvEvent::RouteAdd { dst, next_hop, .. } => {
                let route = Route {
                    dst: dst.clone(),
                    next_hop: next_hop.clone(),
                };
                match node.fib.iter_mut().find(|r| r.dst == *dst) {
                    Some(existing) => *existing = route,
                    None => node.fib.push(route),
                }
            }
            RtvEvent::RouteDel { dst, next_hop, .. } => {
                node.fib.retain(|r| {
                    r.dst != *dst || next_hop.as_ref().is_some_and(|hop| *hop != r.next_hop)
                });
            }
        }
    }

    /// Every route whose next hop belongs to another known node.
    pub fn edges(&self) -> Vec<Edge> {
        let edges: BTreeSet<Edge> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.fib.iter().filter_map(move |route| {
                    let target = self.resolve(&route.next_hop)?;
                    (target != node.id).then(|| Edge {
                        id: format!("{}->{}", node.id, target),
                        source: node.id.clone(),
                        target: target.to_owned(),
                    })
                })
            })
            .collect();
        edges.into_iter().collect()
    }

    /// The full state, as sent to a viewer that just connected.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().map(Node::view).collect(),
            edges: self.edges(),
        }
    }

    #[cfg(test)]
    fn rebuilt_index(&self) -> AddressIndex {
        let mut index = AddressIndex::new();
        for node in self.nodes.values() {
            for addr in node.ifconfig.values().flatten() {
                index_add(&mut index, &node.id, addr);
            }
        }
        index
    }
}
