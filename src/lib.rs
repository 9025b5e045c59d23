//! Gateway for Viessmann heating controllers attached through the OptoLink
//! optical interface.
//!
//! The crate drives the two OptoLink line protocols (the polled KW protocol
//! and the framed P300 protocol) over a local serial device or a
//! serial-over-TCP bridge, resolves named event types through the
//! Vitosoft-style XML catalogs, and decodes register blocks into typed
//! values: temperatures, durations, timestamps, switching schedules and
//! fault histories.

mod cache;
pub mod catalog;
pub mod codec;
pub mod commands;
pub mod connection;
pub mod datapoint;
pub mod device;
pub mod fsm;
pub mod output;
pub mod protocol;

pub use codec::Value;
pub use datapoint::{DataPoint, EventType};
pub use device::Device;
pub use protocol::{Command, CommandError, CommandKind, CommandResult};
