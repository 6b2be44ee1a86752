//! This crate contains an asynchronous client core for key-value servers that speak the
//! Redis serialization protocol (RESP). Requests are encoded as arrays of bulk strings and
//! replies are assembled by an incremental decoder from whatever fragments the transport
//! delivers. A pool owns a fixed set of persistent connections, each carrying at most one
//! request at a time, and hands requests to whichever connection is idle.

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]

pub mod conf;
pub mod net;
mod shutdown;
pub mod telemetry;

/// Default port address of the server
pub const DEFAULT_PORT: u16 = 6379;

pub use net::{Client, Config, Error, Pool, Reply, Request};
