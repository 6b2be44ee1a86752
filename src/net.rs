//! A client for servers speaking the Redis serialization protocol (RESP): a reply
//! decoder, a request encoder, single-flight connections and the pool that owns them.

mod client;
mod config;
pub mod connection;
mod error;
pub mod frame;
pub mod pool;
pub mod request;

#[cfg(test)]
mod testing;

pub use self::{
    client::Client,
    config::Config,
    connection::{Connection, Continuation, Status},
    error::Error,
    frame::{Decoder, FrameError, Reply},
    pool::{Connector, Exhaustion, Pool, PoolBuilder, PoolStatus, TcpConnector},
    request::{Arg, Request},
};
