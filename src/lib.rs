//! RIOT-TV is a live view into a wireless sensor-network testbed. The nodes
//! of the testbed run a network stack that prints its interface and routing
//! changes on the console; a reporter watches those consoles, turns what it
//! sees into structured records and relays them to an anchor, which keeps
//! the picture of the network and streams it to any number of viewers.
//!
//! The reporter side is made of the [`framer`], which cuts the device's byte
//! stream into lines, the [`device_parser`], which recognizes dumps and
//! tagged events in them, the [`output_buffer`], which batches raw output
//! per node, and the [`anchor_link`], which keeps the connection to the
//! anchor. [`reporter`] ties them together.
//!
//! The anchor side is the [`graph`] state, the [`fanout`] to viewers, and
//! the [`relay`] event loop that owns both.
//!
//! Both talk the record format defined in [`wire`].

#![warn(missing_docs)]
pub mod anchor_link;
pub mod args;
pub mod device;
pub mod device_parser;
pub mod fanout;
pub mod framer;
pub mod graph;
pub mod inventory;
pub mod output_buffer;
pub mod pump;
pub mod relay;
pub mod reporter;
pub mod wire;
