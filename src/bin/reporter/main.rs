//! Watches a testbed's device output and reports it to the anchor.

use clap::Parser;
use log::{error, info};
use riottv::{
    anchor_link::{AnchorLink, RetryPolicy},
    args::ReporterArgs,
    device::{spawn_dispatcher, DeviceLink},
    framer::LineFramer,
    inventory::load_inventory,
    pump::spawn_pump,
    reporter::{self, Reporter, ReporterEvent},
    wire::ReporterMessage,
};
use std::{process::ExitCode, sync::mpsc};

// Example:
// cargo run --bin reporter -- socket 20000 localhost 23511
//                          --inventory nodes.ron

fn main() -> ExitCode {
    env_logger::init();
    let args = ReporterArgs::parse();

    let greeting = match &args.inventory {
        Some(path) => match load_inventory(path) {
            Ok(nodes) => {
                info!("Loaded {} nodes from {}", nodes.len(), path.display());
                Some(ReporterMessage::NodesInfo { data: nodes })
            }
            Err(e) => {
                error!("Unable to load inventory {}: {}", path.display(), e);
                eprintln!("Unable to load inventory {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let device = match DeviceLink::open(args.comm_type, &args.dev, args.baud) {
        Ok(device) => device,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let halves = device.reader().and_then(|r| device.writer().map(|w| (r, w)));
    let (reader, writer) = match halves {
        Ok(halves) => halves,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (events_tx, events_rx) = mpsc::channel();
    let policy = RetryPolicy {
        error_delay: args.retry(),
    };
    let (link, _link_thread) =
        AnchorLink::connect(args.anchor_addr(), greeting, policy, events_tx.clone());
    let (commands, _dispatcher) = spawn_dispatcher(writer, args.stagger());
    let _device_thread = spawn_pump(
        "Device reader".to_owned(),
        LineFramer::new(reader),
        events_tx,
        ReporterEvent::Device,
        ReporterEvent::DeviceClosed,
    );

    match reporter::run(events_rx, Reporter::new(link, args.debounce()), commands) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Device failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
