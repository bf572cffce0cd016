//! The records exchanged between the reporter, the anchor and the viewers,
//! and the framing that carries them over a byte stream.
//!
//! Every record travels as `<length>#<json>`, where `<length>` is the decimal
//! byte length of the JSON text that follows the `#`. Two record shapes are
//! in use:
//!
//! - [`ReporterMessage`]s are flat objects discriminated by a `type` field,
//!   with the tagged device events additionally carrying a `subType`.
//! - [`ControlMessage`]s and [`ViewerMessage`]s are event envelopes,
//!   `{"type": <event>, "data": <payload>}`.

use log::debug;
use nom::{
    bytes::streaming::tag,
    character::streaming::digit1,
    combinator::map_res,
    sequence::terminated,
    IResult,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    io::{self, Read, Write},
    marker::PhantomData,
    sync::mpsc::Sender,
};

/// Identifies one testbed node within a session.
pub type NodeId = String;

/// Descriptor of one testbed node, as published in `nodesInfo`. Only `id` is
/// interpreted; labels, sizes and positions are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node id the device output is tagged with
    pub id: NodeId,
    /// Display and position metadata
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeInfo {
    /// A descriptor with no metadata beyond the id.
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            extra: serde_json::Map::new(),
        }
    }
}

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination prefix
    pub dst: String,
    /// Address of the next hop
    #[serde(rename = "nextHop")]
    pub next_hop: String,
}

/// Result of a full interface table dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfconfigRecord {
    /// Node the dump came from
    pub node: NodeId,
    /// Interface named by the dump, `None` if the dump never named one
    pub iface: Option<String>,
    /// Addresses in the order they were listed
    pub addrs: Vec<String>,
}

/// Result of a full routing table dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibRecord {
    /// Node the dump came from
    pub node: NodeId,
    /// Entries in the order they were listed
    pub entries: Vec<Route>,
}

/// A structured event the network stack reported on its own, outside of any
/// command output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subType")]
pub enum RtvEvent {
    /// An address was assigned to an interface
    #[serde(rename = "IFCONFIG_ADDR_ADD")]
    AddrAdd {
        /// Reporting node
        node: NodeId,
        /// Interface the address belongs to
        iface: String,
        /// The address
        ipaddr: String,
    },

    /// An address was removed from an interface
    #[serde(rename = "IFCONFIG_ADDR_DEL")]
    AddrDel {
        /// Reporting node
        node: NodeId,
        /// Interface the address belonged to
        iface: String,
        /// The address
        ipaddr: String,
    },

    /// A route was installed
    #[serde(rename = "FIB_ROUTE_ADD")]
    RouteAdd {
        /// Reporting node
        node: NodeId,
        /// Destination prefix
        dst: String,
        /// Address of the next hop
        #[serde(rename = "nextHop")]
        next_hop: String,
    },

    /// A route was removed
    #[serde(rename = "FIB_ROUTE_DEL")]
    RouteDel {
        /// Reporting node
        node: NodeId,
        /// Destination prefix
        dst: String,
        /// Next hop, when the device reported it
        #[serde(rename = "nextHop", default, skip_serializing_if = "Option::is_none")]
        next_hop: Option<String>,
    },
}

impl RtvEvent {
    /// The node that reported this event.
    pub fn node(&self) -> &str {
        match self {
            RtvEvent::AddrAdd { node, .. }
            | RtvEvent::AddrDel { node, .. }
            | RtvEvent::RouteAdd { node, .. }
            | RtvEvent::RouteDel { node, .. } => node,
        }
    }

    /// The `subType` discriminator, which is also the event name viewers see.
    pub fn sub_type(&self) -> &'static str {
        match self {
            RtvEvent::AddrAdd { .. } => "IFCONFIG_ADDR_ADD",
            RtvEvent::AddrDel { .. } => "IFCONFIG_ADDR_DEL",
            RtvEvent::RouteAdd { .. } => "FIB_ROUTE_ADD",
            RtvEvent::RouteDel { .. } => "FIB_ROUTE_DEL",
        }
    }
}

/// Everything a reporter sends to the anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReporterMessage {
    /// The testbed's node inventory, sent once per connection
    #[serde(rename = "nodesInfo")]
    NodesInfo {
        /// One descriptor per node
        data: Vec<NodeInfo>,
    },

    /// A completed interface dump
    #[serde(rename = "ifconfig")]
    Ifconfig(IfconfigRecord),

    /// A completed routing table dump
    #[serde(rename = "fib")]
    Fib(FibRecord),

    /// A block of raw output from one node
    #[serde(rename = "command_output")]
    CommandOutput {
        /// The lines, each terminated by `\n`
        output: String,
    },

    /// A tagged stack event
    #[serde(rename = "RTV")]
    Rtv(RtvEvent),
}

/// A command to be typed into one or more nodes' shells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Target nodes, in dispatch order. Empty means every node at once.
    pub nodes: Vec<NodeId>,
    /// The command line, without a trailing newline
    pub cmd: String,
}

/// Viewer to anchor, and anchor to reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    /// Run a shell command on the device side
    #[serde(rename = "command")]
    Command(CommandRequest),
}

/// A link between two nodes, derived from a route's next hop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// `<source>-><target>`
    pub id: String,
    /// Node owning the route
    pub source: NodeId,
    /// Node owning the next hop address
    pub target: NodeId,
}

/// A node as a viewer sees it in `graphInit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Descriptor fields
    #[serde(flatten)]
    pub info: NodeInfo,
    /// Interface name to assigned addresses
    pub ifconfig: BTreeMap<String, Vec<String>>,
    /// Routing table
    pub fib: Vec<Route>,
}

/// The whole graph, sent to each viewer when it connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Every known node
    pub nodes: Vec<NodeView>,
    /// Every resolvable next hop link
    pub edges: Vec<Edge>,
}

/// Everything the anchor sends to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ViewerMessage {
    /// Full state, sent once on connect
    #[serde(rename = "graphInit")]
    GraphInit(GraphSnapshot),
    /// Relayed node inventory
    #[serde(rename = "nodesInfo")]
    NodesInfo(Vec<NodeInfo>),
    /// Relayed raw output block
    #[serde(rename = "command_output")]
    CommandOutput(String),
    /// Relayed interface dump
    #[serde(rename = "ifconfig")]
    Ifconfig(IfconfigRecord),
    /// Relayed routing dump
    #[serde(rename = "fib")]
    Fib(FibRecord),
    // The tagged events keep their subtype as the event name.
    #[allow(missing_docs)]
    #[serde(rename = "IFCONFIG_ADDR_ADD")]
    AddrAdd(RtvEvent),
    #[allow(missing_docs)]
    #[serde(rename = "IFCONFIG_ADDR_DEL")]
    AddrDel(RtvEvent),
    #[allow(missing_docs)]
    #[serde(rename = "FIB_ROUTE_ADD")]
    RouteAdd(RtvEvent),
    #[allow(missing_docs)]
    #[serde(rename = "FIB_ROUTE_DEL")]
    RouteDel(RtvEvent),
}

impl From<RtvEvent> for ViewerMessage {
    fn from(event: RtvEvent) -> Self {
        match event {
            RtvEvent::AddrAdd { .. } => ViewerMessage::AddrAdd(event),
            RtvEvent::AddrDel { .. } => ViewerMessage::AddrDel(event),
            RtvEvent::RouteAdd { .. } => ViewerMessage::RouteAdd(event),
            RtvEvent::RouteDel { .. } => ViewerMessage::RouteDel(event),
        }
    }
}

impl From<ReporterMessage> for ViewerMessage {
    fn from(msg: ReporterMessage) -> Self {
        match msg {
            ReporterMessage::NodesInfo { data } => ViewerMessage::NodesInfo(data),
            ReporterMessage::Ifconfig(record) => ViewerMessage::Ifconfig(record),
            ReporterMessage::Fib(record) => ViewerMessage::Fib(record),
            ReporterMessage::CommandOutput { output } => ViewerMessage::CommandOutput(output),
            ReporterMessage::Rtv(event) => event.into(),
        }
    }
}

/// Things that go wrong while moving records over a stream.
#[derive(Debug)]
pub enum WireError {
    /// The underlying stream failed
    Io(io::Error),

    /// A frame's payload was not the record we expected
    Json(serde_json::Error),

    /// The stream does not start with a `<length>#` header
    BadHeader,

    /// The stream ended in the middle of a frame
    Truncated,

    /// The receiving side of a channel has gone away
    Closed,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            WireError::Io(error) => Cow::from(format!("io error: {}", error)),
            WireError::Json(error) => Cow::from(format!("json error: {}", error)),
            WireError::BadHeader => Cow::from("malformed frame header"),
            WireError::Truncated => Cow::from("stream ended inside a frame"),
            WireError::Closed => Cow::from("peer closed"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for WireError {}

impl From<io::Error> for WireError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for WireError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Serializes `msg` into one complete frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;
    let mut frame = format!("{}#", json.len()).into_bytes();
    frame.extend_from_slice(&json);
    Ok(frame)
}

fn frame_header(input: &[u8]) -> IResult<&[u8], usize> {
    terminated(
        map_res(map_res(digit1, std::str::from_utf8), |digits: &str| {
            digits.parse::<usize>()
        }),
        tag("#"),
    )(input)
}

/// Splits one frame off the front of `buf`. Returns the payload length and
/// the total number of bytes the frame occupies, or `None` if more bytes are
/// needed.
fn split_frame(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    match frame_header(buf) {
        Ok((rest, len)) => {
            let header_len = buf.len() - rest.len();
            if rest.len() < len {
                Ok(None)
            } else {
                Ok(Some((header_len, header_len + len)))
            }
        }
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(_) => Err(WireError::BadHeader),
    }
}

/// Reads frames off a stream and decodes them into `T`s.
///
/// Frames whose JSON does not decode into `T` are skipped. Any other failure
/// is yielded once, after which the iterator is exhausted.
pub struct FrameReader<R, T> {
    inner: R,
    buf: Vec<u8>,
    done: bool,
    _record: PhantomData<fn() -> T>,
}

impl<R: Read, T: DeserializeOwned> FrameReader<R, T> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            done: false,
            _record: PhantomData,
        }
    }

    /// Reads the next record, `Ok(None)` on a clean end of stream.
    pub fn read_message(&mut self) -> Result<Option<T>, WireError> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some((start, end)) = split_frame(&self.buf)? {
                let decoded = serde_json::from_slice::<T>(&self.buf[start..end]);
                self.buf.drain(..end);
                match decoded {
                    Ok(record) => return Ok(Some(record)),
                    Err(error) => {
                        debug!("Skipping undecodable frame: {}", error);
                        continue;
                    }
                }
            }

            let read_len = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read_len == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(WireError::Truncated)
                };
            }
            self.buf.extend_from_slice(&chunk[..read_len]);
        }
    }
}

impl<R: Read, T: DeserializeOwned> Iterator for FrameReader<R, T> {
    type Item = Result<T, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_message() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

/// Writes frames onto a stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps a byte stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes and flushes one frame.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), WireError> {
        let frame = encode_frame(msg)?;
        self.inner.write_all(&frame)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Somewhere a record can be posted to. Posting never waits for the peer to
/// process the record.
pub trait Outbox<M>: Send {
    /// Hands `msg` over for delivery.
    fn post(&mut self, msg: &M) -> Result<(), WireError>;
}

impl<M: Clone + Send> Outbox<M> for Sender<M> {
    fn post(&mut self, msg: &M) -> Result<(), WireError> {
        self.send(msg.clone()).map_err(|_| WireError::Closed)
    }
}

impl<M: Serialize, W: Write + Send> Outbox<M> for FrameWriter<W> {
    fn post(&mut self, msg: &M) -> Result<(), WireError> {
        self.send(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    /// A reader that hands out at most `step` bytes per read
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn frame_has_length_prefix() {
        let frame = encode_frame(&ReporterMessage::CommandOutput {
            output: "ok\n".to_owned(),
        })
        .unwrap();
        let text = String::from_utf8(frame).unwrap();
        let (len, json) = text.split_once('#').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), json.len());
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(json).unwrap(),
            json!({"type": "command_output", "output": "ok\n"})
        );
    }

    #[test]
    fn rtv_record_shape() {
        let msg = ReporterMessage::Rtv(RtvEvent::RouteAdd {
            node: "m3-7".to_owned(),
            dst: "2001:db8::/64".to_owned(),
            next_hop: "fe80::2".to_owned(),
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "RTV",
                "subType": "FIB_ROUTE_ADD",
                "node": "m3-7",
                "dst": "2001:db8::/64",
                "nextHop": "fe80::2",
            })
        );

        let back: ReporterMessage = serde_json::from_value(json!({
            "type": "RTV",
            "subType": "FIB_ROUTE_DEL",
            "node": "m3-7",
            "dst": "2001:db8::1",
        }))
        .unwrap();
        assert_eq!(
            back,
            ReporterMessage::Rtv(RtvEvent::RouteDel {
                node: "m3-7".to_owned(),
                dst: "2001:db8::1".to_owned(),
                next_hop: None,
            })
        );
    }

    #[test]
    fn command_envelope_shape() {
        let msg: ControlMessage = serde_json::from_value(json!({
            "type": "command",
            "data": {"nodes": ["m3-1", "m3-2"], "cmd": "ifconfig"},
        }))
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Command(CommandRequest {
                nodes: vec!["m3-1".to_owned(), "m3-2".to_owned()],
                cmd: "ifconfig".to_owned(),
            })
        );
    }

    #[test]
    fn viewer_sees_subtype_as_event_name() {
        let event = RtvEvent::AddrDel {
            node: "a".to_owned(),
            iface: "7".to_owned(),
            ipaddr: "fe80::1".to_owned(),
        };
        let value = serde_json::to_value(ViewerMessage::from(event)).unwrap();
        assert_eq!(value["type"], "IFCONFIG_ADDR_DEL");
        assert_eq!(value["data"]["ipaddr"], "fe80::1");
        assert_eq!(value["data"]["subType"], "IFCONFIG_ADDR_DEL");
    }

    #[test]
    fn node_info_keeps_metadata() {
        let info: NodeInfo =
            serde_json::from_value(json!({"id": "m3-1", "x": 1.5, "label": "m3-1"})).unwrap();
        assert_eq!(info.id, "m3-1");
        assert_eq!(info.extra["x"], json!(1.5));
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"id": "m3-1", "x": 1.5, "label": "m3-1"})
        );
    }

    #[test]
    fn reader_reassembles_split_frames() {
        let mut data = Vec::new();
        for output in ["one\n", "two\n", "three\n"] {
            data.extend(
                encode_frame(&ReporterMessage::CommandOutput {
                    output: output.to_owned(),
                })
                .unwrap(),
            );
        }
        let reader: FrameReader<_, ReporterMessage> = FrameReader::new(Trickle {
            data,
            pos: 0,
            step: 3,
        });
        let outputs: Vec<String> = reader
            .map(|r| match r.unwrap() {
                ReporterMessage::CommandOutput { output } => output,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(outputs, vec!["one\n", "two\n", "three\n"]);
    }

    #[test]
    fn reader_skips_unknown_records() {
        let mut data = b"16#{\"type\":\"bogus\"}".to_vec();
        data.extend(
            encode_frame(&ControlMessage::Command(CommandRequest {
                nodes: vec![],
                cmd: "help".to_owned(),
            }))
            .unwrap(),
        );
        let mut reader: FrameReader<_, ControlMessage> = FrameReader::new(Cursor::new(data));
        let ControlMessage::Command(req) = reader.next().unwrap().unwrap();
        assert_eq!(req.cmd, "help");
        assert!(reader.next().is_none());
    }

    #[test]
    fn reader_rejects_garbage_header() {
        let mut reader: FrameReader<_, ControlMessage> =
            FrameReader::new(Cursor::new(b"hello#{}".to_vec()));
        assert!(matches!(reader.next(), Some(Err(WireError::BadHeader))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn reader_reports_truncation() {
        let mut reader: FrameReader<_, ControlMessage> =
            FrameReader::new(Cursor::new(b"40#{\"type\":".to_vec()));
        assert!(matches!(reader.next(), Some(Err(WireError::Truncated))));
    }

    #[test]
    fn writer_and_channel_are_outboxes() {
        let mut buf = Vec::new();
        let msg = ViewerMessage::CommandOutput("x\n".to_owned());
        Outbox::post(&mut FrameWriter::new(&mut buf), &msg).unwrap();
        let mut reader: FrameReader<_, ViewerMessage> = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.next().unwrap().unwrap(), msg);

        let (tx, rx) = std::sync::mpsc::channel();
        let mut outbox: Box<dyn Outbox<ViewerMessage>> = Box::new(tx);
        outbox.post(&msg).unwrap();
        assert_eq!(rx.recv().unwrap(), msg);
        drop(rx);
        assert!(matches!(outbox.post(&msg), Err(WireError::Closed)));
    }
}
