use std::time::Duration;

use serde::Deserialize;

use super::{
    pool::{Exhaustion, Pool, PoolBuilder, TcpConnector},
    Error,
};

/// Connection pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The host address of the server.
    pub host: String,

    /// The port number of the server.
    pub port: u16,

    /// Number of connections opened when the pool is built.
    pub connections: usize,

    /// What to do with a request when every connection is busy.
    pub exhaustion: Exhaustion,

    /// Max number of milliseconds a request waits for an idle connection under the
    /// `wait` policy. Waits forever if unset.
    pub acquire_timeout_ms: Option<u64>,

    /// Max number of milliseconds to wait for a reply before the connection is closed.
    pub request_timeout_ms: Option<u64>,

    /// Max number of milliseconds to wait for a connection to be established.
    pub connect_timeout_ms: Option<u64>,
}

impl Config {
    /// The server address as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A connector for the configured server.
    pub fn connector(&self) -> TcpConnector {
        let connector = TcpConnector::new(self.addr());
        match self.connect_timeout_ms {
            Some(ms) => connector.connect_timeout(Duration::from_millis(ms)),
            None => connector,
        }
    }

    /// A pool builder carrying the configured size, policy and timeouts.
    pub fn builder(&self) -> PoolBuilder {
        let mut builder = PoolBuilder::new(self.connections).exhaustion(self.exhaustion);
        if let Some(ms) = self.acquire_timeout_ms {
            builder = builder.acquire_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.request_timeout_ms {
            builder = builder.request_timeout(Duration::from_millis(ms));
        }
        builder
    }

    /// Connect to the configured server and build the pool.
    pub async fn pool(&self) -> Result<Pool, Error> {
        self.builder().build(self.connector()).await
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            connections: 1,
            exhaustion: Exhaustion::Fail,
            acquire_timeout_ms: None,
            request_timeout_ms: None,
            connect_timeout_ms: None,
        }
    }
}
