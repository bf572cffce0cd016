//! The reporter's side of the physical link: opening the device, and typing
//! commands into it.
//!
//! A device is either a serial port (a single board on a USB cable) or a TCP
//! socket (the testbed's serial aggregator, or a native build of the
//! firmware). Either way it is a byte stream in both directions.

use crate::wire::CommandRequest;
use clap::ValueEnum;
use log::{info, warn};
use serial2::SerialPort;
use std::{
    borrow::Cow,
    fmt,
    io::{self, Read, Write},
    net::TcpStream,
    sync::{
        mpsc::{self, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Spacing between writes of one command to several nodes, unless configured
/// otherwise. The nodes share one radio channel and one aggregator.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(150);

/// How the device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CommType {
    /// A serial port such as `/dev/ttyUSB0`
    Uart,
    /// A TCP socket, given as `port` or `host:port`
    Socket,
}

/// Failures opening or talking to the device.
#[derive(Debug)]
pub enum DeviceError {
    /// The device could not be opened
    Open {
        /// What we tried to open
        dev: String,
        /// Why it failed
        error: io::Error,
    },

    /// The device exists but refused to hand out another handle
    Io(io::Error),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            DeviceError::Open { dev, error } => {
                Cow::from(format!("unable to open device {}: {}", dev, error))
            }
            DeviceError::Io(error) => Cow::from(format!("io error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for DeviceError {}

impl From<io::Error> for DeviceError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Turns the socket device argument into an address. A bare port means a
/// socket on this host.
pub fn socket_address(dev: &str) -> String {
    if dev.parse::<u16>().is_ok() {
        format!("127.0.0.1:{}", dev)
    } else {
        dev.to_owned()
    }
}

/// One serial port handle that can be read and written from different
/// threads.
struct SerialHalf(Arc<SerialPort>);

impl Read for SerialHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SerialHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

enum Link {
    Serial(Arc<SerialPort>),
    Socket(TcpStream),
}

/// An open device.
pub struct DeviceLink {
    link: Link,
}

impl DeviceLink {
    /// Opens the device. This is the only failure the reporter cannot
    /// recover from.
    pub fn open(comm_type: CommType, dev: &str, baud_rate: u32) -> Result<Self, DeviceError> {
        let open_error = |error| DeviceError::Open {
            dev: dev.to_owned(),
            error,
        };

        let link = match comm_type {
            CommType::Uart => {
                let mut port = SerialPort::open(dev, baud_rate).map_err(open_error)?;
                // Block on reads for about 584,942,417,355 years
                port.set_read_timeout(Duration::MAX).map_err(open_error)?;
                Link::Serial(Arc::new(port))
            }
            CommType::Socket => {
                let stream = TcpStream::connect(socket_address(dev)).map_err(open_error)?;
                stream.set_nodelay(true).map_err(open_error)?;
                Link::Socket(stream)
            }
        };
        info!("Opened {:?} device {}", comm_type, dev);
        Ok(Self { link })
    }

    /// A handle to read device output from.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>, DeviceError> {
        Ok(match &self.link {
            Link::Serial(port) => Box::new(SerialHalf(port.clone())),
            Link::Socket(stream) => Box::new(stream.try_clone()?),
        })
    }

    /// A handle to type commands into.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>, DeviceError> {
        Ok(match &self.link {
            Link::Serial(port) => Box::new(SerialHalf(port.clone())),
            Link::Socket(stream) => Box::new(stream.try_clone()?),
        })
    }
}

/// One write scheduled relative to the start of a command's dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    /// Delay from the first write
    pub at: Duration,
    /// Exact bytes to write, newline included
    pub line: String,
}

/// Lays out the device writes for a command.
///
/// A command for specific nodes becomes one `<node>;<cmd>` line per node, in
/// the order given, `stagger` apart. A command with no nodes goes to the
/// whole testbed as a single unprefixed line.
pub fn plan_writes(req: &CommandRequest, stagger: Duration) -> Vec<PlannedWrite> {
    if req.nodes.is_empty() {
        return vec![PlannedWrite {
            at: Duration::ZERO,
            line: format!("{}\n", req.cmd),
        }];
    }

    req.nodes
        .iter()
        .enumerate()
        .map(|(i, node)| PlannedWrite {
            at: stagger * i as u32,
            line: format!("{};{}\n", node, req.cmd),
        })
        .collect()
}

/// Starts the thread that types commands into the device. Commands are
/// handled one after another; each one's writes follow [`plan_writes`].
pub fn spawn_dispatcher<W>(mut writer: W, stagger: Duration) -> (Sender<CommandRequest>, JoinHandle<()>)
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<CommandRequest>();

    let handle = thread::spawn(move || {
        for req in rx {
            let start = Instant::now();
            for write in plan_writes(&req, stagger) {
                let due = start + write.at;
                let now = Instant::now();
                if due > now {
                    spin_sleep::sleep(due - now);
                }

                info!("COMMAND: {}", write.line.trim_end());
                if let Err(error) = writer
                    .write_all(write.line.as_bytes())
                    .and_then(|_| writer.flush())
                {
                    warn!("Failed to write command to the device: {}", error);
                }
            }
        }
        info!("Command dispatcher : terminated.");
    });

    (tx, handle)
}
