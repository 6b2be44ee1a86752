use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::debug;

use super::{
    frame::Reply,
    pool::Pool,
    request::{Arg, Request},
    Config, Error,
};

/// Typed key-value commands on top of a [`Pool`].
///
/// Each method builds a [`Request`], sends it through an idle pooled connection and
/// checks the shape of the reply. Error replies surface as [`Error::Command`], replies
/// of the wrong shape as [`Error::UnexpectedReply`]. Both leave the pool usable.
pub struct Client<S = TcpStream> {
    pool: Pool<S>,
}

impl<S> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

impl Client {
    /// Opens the pool described by the configuration.
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let pool = config.pool().await?;
        Ok(Self::new(pool))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an existing pool.
    pub fn new(pool: Pool<S>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<S> {
        &self.pool
    }

    /// Sends a raw request and returns the reply as is, error replies included.
    pub async fn send(&self, request: Request) -> Result<Reply, Error> {
        self.pool.send(request).await
    }

    /// Submits a raw request without waiting, see [`Pool::submit`].
    pub fn submit<F>(&self, request: Request, continuation: F) -> Result<(), Error>
    where
        F: FnOnce(Result<Reply, Error>) + Send + 'static,
    {
        self.pool.submit(request, continuation)
    }

    /// Closes the underlying pool.
    pub fn close(&self) -> Result<(), Error> {
        self.pool.close()
    }

    /// Checks that the server answers.
    #[tracing::instrument(skip_all)]
    pub async fn ping(&self) -> Result<(), Error> {
        match self.call(Request::new("PING")).await? {
            Reply::Status(s) if s == "PONG" => Ok(()),
            reply => Err(Error::UnexpectedReply(reply)),
        }
    }

    /// Get the value of the key.
    ///
    /// Returns `None` if the key does not exist.
    #[tracing::instrument(skip_all)]
    pub async fn get<K>(&self, key: K) -> Result<Option<Bytes>, Error>
    where
        K: Into<Arg>,
    {
        expect_bulk(self.call(Request::new("GET").arg(key)).await?)
    }

    /// Set the value of the key, overwriting whatever the key holds.
    #[tracing::instrument(skip_all)]
    pub async fn set<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: Into<Arg>,
        V: Into<Arg>,
    {
        expect_ok(self.call(Request::new("SET").arg(key).arg(value)).await?)
    }

    /// Set the value of the key and return the value it held before.
    #[tracing::instrument(skip_all)]
    pub async fn get_set<K, V>(&self, key: K, value: V) -> Result<Option<Bytes>, Error>
    where
        K: Into<Arg>,
        V: Into<Arg>,
    {
        expect_bulk(self.call(Request::new("GETSET").arg(key).arg(value)).await?)
    }

    /// Removes the specified keys, ignoring non-existed keys.
    ///
    /// Returns the number of keys that were removed.
    #[tracing::instrument(skip_all)]
    pub async fn del<I, K>(&self, keys: I) -> Result<i64, Error>
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("DEL").args(keys)).await?)
    }

    /// Counts how many of the keys exist.
    #[tracing::instrument(skip_all)]
    pub async fn exists<I, K>(&self, keys: I) -> Result<i64, Error>
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("EXISTS").args(keys)).await?)
    }

    /// Increments the number stored at the key by one.
    #[tracing::instrument(skip_all)]
    pub async fn incr<K>(&self, key: K) -> Result<i64, Error>
    where
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("INCR").arg(key)).await?)
    }

    /// Increments the number stored at the key by `by`.
    #[tracing::instrument(skip_all, fields(by = by))]
    pub async fn incr_by<K>(&self, key: K, by: i64) -> Result<i64, Error>
    where
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("INCRBY").arg(key).arg(by)).await?)
    }

    /// Decrements the number stored at the key by one.
    #[tracing::instrument(skip_all)]
    pub async fn decr<K>(&self, key: K) -> Result<i64, Error>
    where
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("DECR").arg(key)).await?)
    }

    /// Decrements the number stored at the key by `by`.
    #[tracing::instrument(skip_all, fields(by = by))]
    pub async fn decr_by<K>(&self, key: K, by: i64) -> Result<i64, Error>
    where
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("DECRBY").arg(key).arg(by)).await?)
    }

    /// Gets the values of all the keys, `None` for those that do not exist.
    #[tracing::instrument(skip_all)]
    pub async fn mget<I, K>(&self, keys: I) -> Result<Vec<Option<Bytes>>, Error>
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        expect_bulks(self.call(Request::new("MGET").args(keys)).await?)
    }

    /// Sets every key to its value.
    #[tracing::instrument(skip_all)]
    pub async fn mset<I, K, V>(&self, pairs: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arg>,
        V: Into<Arg>,
    {
        let request = pairs
            .into_iter()
            .fold(Request::new("MSET"), |req, (k, v)| req.arg(k).arg(v));
        expect_ok(self.call(request).await?)
    }

    /// Length of the value stored at the key, zero if the key does not exist.
    #[tracing::instrument(skip_all)]
    pub async fn strlen<K>(&self, key: K) -> Result<i64, Error>
    where
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("STRLEN").arg(key)).await?)
    }

    /// Sets a timeout on the key, in seconds.
    ///
    /// Returns `false` if the key does not exist.
    #[tracing::instrument(skip_all, fields(seconds = seconds))]
    pub async fn expire<K>(&self, key: K, seconds: i64) -> Result<bool, Error>
    where
        K: Into<Arg>,
    {
        let set = expect_integer(self.call(Request::new("EXPIRE").arg(key).arg(seconds)).await?)?;
        Ok(set == 1)
    }

    /// Remaining time to live of the key in seconds, `-1` without a timeout and `-2`
    /// if the key does not exist.
    #[tracing::instrument(skip_all)]
    pub async fn ttl<K>(&self, key: K) -> Result<i64, Error>
    where
        K: Into<Arg>,
    {
        expect_integer(self.call(Request::new("TTL").arg(key)).await?)
    }

    /// Keys matching the glob-style pattern.
    #[tracing::instrument(skip_all)]
    pub async fn keys<P>(&self, pattern: P) -> Result<Vec<Bytes>, Error>
    where
        P: Into<Arg>,
    {
        expect_bulks(self.call(Request::new("KEYS").arg(pattern)).await?)?
            .into_iter()
            .map(|key| key.ok_or(Error::UnexpectedReply(Reply::Null)))
            .collect()
    }

    async fn call(&self, request: Request) -> Result<Reply, Error> {
        debug!(?request);
        let reply = self.pool.send(request).await?;
        debug!(?reply);
        reply.into_result()
    }
}

fn expect_ok(reply: Reply) -> Result<(), Error> {
    match reply {
        Reply::Status(s) if s == "OK" => Ok(()),
        reply => Err(Error::UnexpectedReply(reply)),
    }
}

fn expect_integer(reply: Reply) -> Result<i64, Error> {
    match reply {
        Reply::Integer(n) => Ok(n),
        reply => Err(Error::UnexpectedReply(reply)),
    }
}

fn expect_bulk(reply: Reply) -> Result<Option<Bytes>, Error> {
    match reply {
        Reply::Bulk(b) => Ok(Some(b)),
        Reply::Null => Ok(None),
        reply => Err(Error::UnexpectedReply(reply)),
    }
}

fn expect_bulks(reply: Reply) -> Result<Vec<Option<Bytes>>, Error> {
    match reply {
        Reply::Array(items) => items.into_iter().map(expect_bulk).collect(),
        reply => Err(Error::UnexpectedReply(reply)),
    }
}
