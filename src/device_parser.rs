//! Decodes the text the nodes print into structured records.
//!
//! The aggregated device stream carries one line per output line of any
//! node, as `<timestamp>;<node id>;<output>`. Most output is just shell
//! chatter, but three kinds of lines mean something:
//!
//! - the echo of an `ifconfig` command starts an interface dump, whose
//!   `Iface  <name>` and `inet6 addr: <addr>` lines follow;
//! - the echo of a `fibroute` command starts a routing table dump, whose
//!   rows are `<dst> <flags> <next hop> <flags> <expiry...>`;
//! - lines containing `RTV|` are events the network stack emits by itself,
//!   `RTV|<SUBTYPE>|<arg>|<arg>`.
//!
//! A dump has no end marker. [`DeviceParser`] keeps accumulating it per node
//! until someone calls [`DeviceParser::flush`], which the output buffer does
//! once the node has gone quiet.

use crate::wire::{FibRecord, IfconfigRecord, NodeId, ReporterMessage, Route, RtvEvent};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_until},
    character::complete::{space0, space1},
    combinator::{map, rest, verify},
    sequence::{pair, preceded, tuple},
    IResult,
};
use std::collections::HashMap;

/// Marks a line as a tagged stack event.
pub const TAG_MARKER: &str = "RTV|";

const IFCONFIG_ECHO: &str = "ifconfig";
const FIBROUTE_ECHO: &str = "fibroute";

/// One line from the device stream, split into its origin and its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLine<'a> {
    /// Node that printed the line
    pub node: &'a str,
    /// What it printed
    pub output: &'a str,
}

/// Splits `<timestamp>;<node id>;<output>`. Returns `None` when the line does
/// not have all three fields.
pub fn split_device_line(line: &str) -> Option<DeviceLine<'_>> {
    let mut parts = line.splitn(3, ';');
    let _timestamp = parts.next()?;
    let node = parts.next()?;
    let output = parts.next()?;
    Some(DeviceLine { node, output })
}

/// Which multi-line dump a node is in the middle of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    /// `ifconfig` output
    Ifconfig,
    /// `fibroute` output
    Fib,
}

/// A line from an interface dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfconfigLine {
    /// The command echo that opened the dump
    Start,
    /// Names the interface being listed
    Iface(String),
    /// One assigned address
    Addr(String),
    /// Anything else the dump prints
    Ignored,
}

/// A line from a routing table dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FibLine {
    /// The command echo that opened the dump
    Start,
    /// One table row
    Entry(Route),
    /// Headers, separators and the like
    Ignored,
}

/// What a single line of a node's output turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Part of an interface dump
    Ifconfig(IfconfigLine),
    /// Part of a routing table dump
    Fib(FibLine),
    /// A well-formed tagged event
    Tagged(RtvEvent),
    /// A tagged line that was cut short or names an unknown event
    MalformedTag,
    /// Ordinary command output
    Plain,
}

/// Recognizes the echo of a dump command, such as `> ifconfig`.
pub fn dump_start(output: &str) -> Option<DumpKind> {
    let trimmed = output.trim_end();
    if trimmed.ends_with(IFCONFIG_ECHO) {
        Some(DumpKind::Ifconfig)
    } else if trimmed.ends_with(FIBROUTE_ECHO) {
        Some(DumpKind::Fib)
    } else {
        None
    }
}

fn word(s: &str) -> IResult<&str, &str> {
    is_not(" \t")(s)
}

fn labelled<'a>(label: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    preceded(pair(take_until(label), tag(label)), word)
}

fn parse_ifconfig_line(s: &str) -> IResult<&str, IfconfigLine> {
    alt((
        map(labelled("Iface  "), |name: &str| {
            IfconfigLine::Iface(name.to_owned())
        }),
        map(labelled("inet6 addr: "), |addr: &str| {
            IfconfigLine::Addr(addr.to_owned())
        }),
    ))(s)
}

fn parse_fib_row(s: &str) -> IResult<&str, Route> {
    map(
        tuple((
            preceded(space0, verify(word, |dst: &str| dst != "Destination")),
            preceded(space1, word),
            preceded(space1, word),
            preceded(space1, word),
            preceded(space1, verify(rest, |tail: &str| !tail.trim().is_empty())),
        )),
        |(dst, _flags, next_hop, _next_hop_flags, _expiry)| Route {
            dst: dst.to_owned(),
            next_hop: next_hop.to_owned(),
        },
    )(s)
}

/// Classifies a line of an interface dump.
pub fn ifconfig_line(output: &str) -> IfconfigLine {
    parse_ifconfig_line(output)
        .map(|(_, line)| line)
        .unwrap_or(IfconfigLine::Ignored)
}

/// Classifies a line of a routing table dump.
pub fn fib_line(output: &str) -> FibLine {
    parse_fib_row(output)
        .map(|(_, route)| FibLine::Entry(route))
        .unwrap_or(FibLine::Ignored)
}

/// Whether a line carries a tagged event, well-formed or not.
pub fn is_tagged(output: &str) -> bool {
    output.contains(TAG_MARKER)
}

/// Decodes `...RTV|<SUBTYPE>|<args>` into an event for `node`. Returns `None`
/// if the line is not tagged, names an unknown subtype, or lacks a required
/// argument. Only the next hop of a route removal is optional.
pub fn tagged_event(node: &str, output: &str) -> Option<RtvEvent> {
    let start = output.find(TAG_MARKER)?;
    let mut tokens = output[start + TAG_MARKER.len()..].trim_end().split('|');
    let sub_type = tokens.next()?;
    let mut arg = || tokens.next().filter(|t| !t.is_empty()).map(str::to_owned);
    let node = node.to_owned();

    let event = match sub_type {
        "IFCONFIG_ADDR_ADD" => RtvEvent::AddrAdd {
            node,
            iface: arg()?,
            ipaddr: arg()?,
        },
        "IFCONFIG_ADDR_DEL" => RtvEvent::AddrDel {
            node,
            iface: arg()?,
            ipaddr: arg()?,
        },
        "FIB_ROUTE_ADD" => RtvEvent::RouteAdd {
            node,
            dst: arg()?,
            next_hop: arg()?,
        },
        "FIB_ROUTE_DEL" => RtvEvent::RouteDel {
            node,
            dst: arg()?,
            next_hop: arg(),
        },
        _ => return None,
    };
    Some(event)
}

#[derive(Debug, Default)]
struct IfconfigDump {
    iface: Option<String>,
    addrs: Vec<String>,
}

#[derive(Debug, Default)]
enum ParseState {
    #[default]
    Idle,
    ParsingIfconfig(IfconfigDump),
    ParsingFib(Vec<Route>),
}

/// Where a node's parser currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Not inside a dump
    Idle,
    /// Inside the given dump
    Dumping(DumpKind),
}

/// Per-node dump state machine.
#[derive(Debug, Default)]
pub struct DeviceParser {
    states: HashMap<NodeId, ParseState>,
}

impl DeviceParser {
    /// A parser with every node idle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line of `node`'s output through its state machine.
    ///
    /// A dump start always opens a fresh accumulator, even if the node was
    /// already in the middle of a dump; whatever was collected so far is
    /// discarded.
    pub fn feed(&mut self, node: &str, output: &str) -> ParsedLine {
        if let Some(kind) = dump_start(output) {
            let fresh = match kind {
                DumpKind::Ifconfig => ParseState::ParsingIfconfig(IfconfigDump::default()),
                DumpKind::Fib => ParseState::ParsingFib(Vec::new()),
            };
            self.states.insert(node.to_owned(), fresh);
            return match kind {
                DumpKind::Ifconfig => ParsedLine::Ifconfig(IfconfigLine::Start),
                DumpKind::Fib => ParsedLine::Fib(FibLine::Start),
            };
        }

        match self.states.get_mut(node) {
            Some(ParseState::ParsingIfconfig(dump)) => {
                let line = ifconfig_line(output);
                match &line {
                    IfconfigLine::Iface(name) => dump.iface = Some(name.clone()),
                    IfconfigLine::Addr(addr) => dump.addrs.push(addr.clone()),
                    IfconfigLine::Start | IfconfigLine::Ignored => {}
                }
                ParsedLine::Ifconfig(line)
            }
            Some(ParseState::ParsingFib(entries)) => {
                let line = fib_line(output);
                if let FibLine::Entry(route) = &line {
                    entries.push(route.clone());
                }
                ParsedLine::Fib(line)
            }
            Some(ParseState::Idle) | None => {
                if !is_tagged(output) {
                    ParsedLine::Plain
                } else if let Some(event) = tagged_event(node, output) {
                    ParsedLine::Tagged(event)
                } else {
                    ParsedLine::MalformedTag
                }
            }
        }
    }

    /// Ends whatever dump `node` is in and returns its record. The node is
    /// idle afterwards. Returns `None` if the node was not dumping.
    pub fn flush(&mut self, node: &str) -> Option<ReporterMessage> {
        match self.states.remove(node)? {
            ParseState::Idle => None,
            ParseState::ParsingIfconfig(dump) => Some(ReporterMessage::Ifconfig(IfconfigRecord {
                node: node.to_owned(),
                iface: dump.iface,
                addrs: dump.addrs,
            })),
            ParseState::ParsingFib(entries) => Some(ReporterMessage::Fib(FibRecord {
                node: node.to_owned(),
                entries,
            })),
        }
    }

    /// Where `node` currently stands.
    pub fn mode(&self, node: &str) -> ParseMode {
        match self.states.get(node) {
            Some(ParseState::ParsingIfconfig(_)) => ParseMode::Dumping(DumpKind::Ifconfig),
            Some(ParseState::ParsingFib(_)) => ParseMode::Dumping(DumpKind::Fib),
            Some(ParseState::Idle) | None => ParseMode::Idle,
        }
    }

    /// Drops every node's progress.
    pub fn reset(&mut self) {
        self.states.clear();
    }
}
