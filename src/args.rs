// Commandline argument parsers using clap for the reporter and the anchor

use crate::device::CommType;
use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// Relays a testbed's device output to the anchor.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct ReporterArgs {
    /// How the device is attached
    #[arg(value_enum, default_value_t = CommType::Uart)]
    pub comm_type: CommType,

    /// Serial port, or `port`/`host:port` of the device socket
    #[arg(default_value = "/dev/ttyUSB0")]
    pub dev: String,

    /// Host the anchor runs on
    #[arg(default_value = "localhost")]
    pub anchor_host: String,

    /// Port the anchor accepts reporters on
    #[arg(default_value_t = 23511)]
    pub anchor_port: u16,

    /// Baud rate of the serial port
    #[arg(short, long, default_value_t = 115200)]
    pub baud: u32,

    /// RON file listing the testbed's nodes, sent to the anchor on connect
    #[arg(short, long)]
    pub inventory: Option<PathBuf>,

    /// Quiet period, in milliseconds, before a node's output is sent on
    #[arg(long = "debounce-ms", default_value_t = 200)]
    pub debounce_ms: u64,

    /// Spacing, in milliseconds, between writes of one command to several nodes
    #[arg(long = "stagger-ms", default_value_t = 150)]
    pub stagger_ms: u64,

    /// Pause, in milliseconds, before re-dialing the anchor after a failure
    #[arg(long = "retry-ms", default_value_t = 1000)]
    pub retry_ms: u64,
}

impl ReporterArgs {
    /// Where to dial the anchor.
    pub fn anchor_addr(&self) -> String {
        format!("{}:{}", self.anchor_host, self.anchor_port)
    }

    /// The debounce period.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// The command write spacing.
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    /// The pause after a failed connection.
    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

/// Bridges one reporter and any number of viewers.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct AnchorArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port reporters connect to
    #[arg(short, long = "reporter-port", default_value_t = 23511)]
    pub reporter_port: u16,

    /// Port viewers connect to
    #[arg(short, long = "viewer-port", default_value_t = 12345)]
    pub viewer_port: u16,
}

impl AnchorArgs {
    /// Address reporters connect to.
    pub fn reporter_addr(&self) -> String {
        format!("{}:{}", self.bind, self.reporter_port)
    }

    /// Address viewers connect to.
    pub fn viewer_addr(&self) -> String {
        format!("{}:{}", self.bind, self.viewer_port)
    }
}
