//! Relays one reporter's session to any number of viewers.

use clap::Parser;
use log::{error, info};
use riottv::{
    args::AnchorArgs,
    relay::{self, spawn_reporter_listener, spawn_viewer_listener, Anchor},
};
use std::{net::TcpListener, process::ExitCode, sync::mpsc};

fn bind(addr: &str, role: &str) -> Option<TcpListener> {
    match TcpListener::bind(addr) {
        Ok(listener) => {
            info!("Listening for {} on {}", role, addr);
            Some(listener)
        }
        Err(e) => {
            error!("Unable to listen for {} on {}: {}", role, addr, e);
            eprintln!("Unable to listen for {} on {}: {}", role, addr, e);
            None
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = AnchorArgs::parse();

    let Some(reporters) = bind(&args.reporter_addr(), "reporters") else {
        return ExitCode::FAILURE;
    };
    let Some(viewers) = bind(&args.viewer_addr(), "viewers") else {
        return ExitCode::FAILURE;
    };

    let (events_tx, events_rx) = mpsc::channel();
    let _reporter_listener = spawn_reporter_listener(reporters, events_tx.clone());
    let _viewer_listener = spawn_viewer_listener(viewers, events_tx);

    relay::run(events_rx, Anchor::new());
    ExitCode::SUCCESS
}
