//! A fixed set of connections to a single server, created eagerly and handed out
//! to one request at a time.

use std::{collections::VecDeque, fmt, future::Future, io, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    runtime::Handle,
    sync::{oneshot, Notify},
    time,
};
use tracing::{debug, info, warn};

use super::{
    connection::{Connection, Settings, Status},
    frame::Reply,
    request::Request,
    Error,
};

/// Opens the transports a pool is made of.
pub trait Connector {
    /// The connected, ready to write transport.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens one transport to the server.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl<C> Connector for &C
where
    C: Connector,
{
    type Stream = C::Stream;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        (**self).connect()
    }
}

/// Opens TCP connections to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Creates a connector for `addr`, given as `host:port`.
    pub fn new<A>(addr: A) -> Self
    where
        A: Into<String>,
    {
        Self {
            addr: addr.into(),
            connect_timeout: None,
        }
    }

    /// Gives up on connecting after `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        let connect_timeout = self.connect_timeout;
        async move {
            let stream = match connect_timeout {
                Some(timeout) => time::timeout(timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
                None => TcpStream::connect(addr).await?,
            };
            // Requests are small, do not wait to coalesce them
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

/// What happens when a request arrives while every connection is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exhaustion {
    /// Fail at once with [`Error::Exhausted`].
    #[default]
    Fail,
    /// Queue up until a connection goes idle, bounded by the acquire timeout.
    Wait,
}

/// Configures and builds a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    size: usize,
    exhaustion: Exhaustion,
    acquire_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    handle: Option<Handle>,
}

impl PoolBuilder {
    /// Starts a pool of `size` connections.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            exhaustion: Exhaustion::default(),
            acquire_timeout: None,
            request_timeout: None,
            handle: None,
        }
    }

    /// Sets the exhaustion policy.
    pub fn exhaustion(mut self, exhaustion: Exhaustion) -> Self {
        self.exhaustion = exhaustion;
        self
    }

    /// Bounds how long [`Exhaustion::Wait`] waits for an idle connection.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Closes a connection whose reply takes longer than `timeout`.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Runtime on which exchanges are spawned. Defaults to the runtime that builds
    /// the pool.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Opens every connection of the pool.
    ///
    /// Fails if any transport cannot be opened, in which case the ones already open
    /// are closed and no pool is returned.
    #[tracing::instrument(skip_all, fields(size = self.size))]
    pub async fn build<C>(self, connector: C) -> Result<Pool<C::Stream>, Error>
    where
        C: Connector,
    {
        let idle = Arc::new(Notify::new());
        let settings = Settings {
            handle: self.handle.unwrap_or_else(Handle::current),
            request_timeout: self.request_timeout,
            idle: idle.clone(),
        };

        let mut connections = Vec::with_capacity(self.size);
        for id in 0..self.size {
            match connector.connect().await {
                Ok(stream) => {
                    connections.push(Connection::with_settings(id, stream, settings.clone()))
                }
                Err(error) => {
                    warn!(id, %error, "could not open connection");
                    for conn in &connections {
                        conn.close();
                    }
                    return Err(error.into());
                }
            }
        }
        info!(exhaustion = ?self.exhaustion, "connection pool ready");

        Ok(Pool {
            inner: Arc::new(Inner {
                members: Mutex::new(Members {
                    connections,
                    closed: false,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                idle,
                exhaustion: self.exhaustion,
                acquire_timeout: self.acquire_timeout,
            }),
        })
    }
}

/// Counts of pooled connections by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections ready for a request.
    pub idle: usize,
    /// Connections with a request in flight.
    pub busy: usize,
    /// Connections that broke and are skipped.
    pub closed: usize,
}

/// A fixed-size set of connections to one server.
///
/// Every connection is opened when the pool is built, and none is ever added or
/// reopened. Requests go to the first idle member; a member that broke stays closed
/// and is skipped. When all members are busy the configured [`Exhaustion`] policy
/// applies. Once [`close`]d the pool refuses every operation with
/// [`Error::PoolClosed`].
///
/// [`close`]: Pool::close
pub struct Pool<S = TcpStream> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    // lock order: members first, then the connection's own state
    members: Mutex<Members<S>>,
    // woken by connections going idle or breaking, by `close`, and by a waiter
    // leaving the queue
    idle: Arc<Notify>,
    exhaustion: Exhaustion,
    acquire_timeout: Option<Duration>,
}

struct Members<S> {
    connections: Vec<Connection<S>>,
    closed: bool,
    // tickets of the callers waiting for an idle connection, oldest first
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

impl<S> Members<S> {
    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.push_back(ticket);
        ticket
    }
}

// A caller's place in the wait queue, given up when dropped.
struct Place<'a, S> {
    inner: &'a Inner<S>,
    ticket: u64,
}

impl<S> Drop for Place<'_, S> {
    fn drop(&mut self) {
        {
            let mut members = self.inner.members.lock();
            if let Some(pos) = members.waiters.iter().position(|t| *t == self.ticket) {
                members.waiters.remove(pos);
            }
        }
        // the next in line may find a connection idle
        self.inner.idle.notify_waiters();
    }
}

impl<S> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("exhaustion", &self.inner.exhaustion)
            .field("closed", &self.is_closed())
            .field("status", &self.status())
            .finish()
    }
}

impl<S> Pool<S> {
    /// Returns `true` once [`close`] has been called.
    ///
    /// [`close`]: Pool::close
    pub fn is_closed(&self) -> bool {
        self.inner.members.lock().closed
    }

    /// Number of member connections, broken ones included. Zero once closed.
    pub fn size(&self) -> usize {
        self.inner.members.lock().connections.len()
    }

    /// Snapshot of the members' statuses.
    pub fn status(&self) -> PoolStatus {
        let members = self.inner.members.lock();
        let mut status = PoolStatus::default();
        for conn in &members.connections {
            match conn.status() {
                Status::Idle => status.idle += 1,
                Status::Busy => status.busy += 1,
                Status::Closed => status.closed += 1,
            }
        }
        status
    }

    /// Closes every member connection.
    ///
    /// In-flight requests receive [`Error::ConnectionClosed`] and callers waiting for
    /// a connection receive [`Error::PoolClosed`]. Fails with [`Error::PoolClosed`] if
    /// the pool was already closed.
    pub fn close(&self) -> Result<(), Error> {
        let connections = {
            let mut members = self.inner.members.lock();
            if members.closed {
                return Err(Error::PoolClosed);
            }
            members.closed = true;
            std::mem::take(&mut members.connections)
        };
        for conn in connections.iter().filter(|c| !c.is_closed()) {
            conn.close();
        }
        self.inner.idle.notify_waiters();
        info!(connections = connections.len(), "connection pool closed");
        Ok(())
    }

    fn first_idle(members: &Members<S>) -> Result<Connection<S>, Error> {
        if members.closed {
            return Err(Error::PoolClosed);
        }
        let mut alive = members.connections.is_empty();
        for conn in &members.connections {
            match conn.status() {
                Status::Idle => return Ok(conn.clone()),
                Status::Busy => alive = true,
                Status::Closed => {}
            }
        }
        if alive {
            Err(Error::Exhausted)
        } else {
            // nothing left that could ever become idle
            Err(Error::ConnectionClosed)
        }
    }
}

impl<S> Pool<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Returns an idle connection without waiting.
    ///
    /// The connection is not reserved: it stays idle until a request is submitted to
    /// it, so submit before yielding to other tasks. Fails with [`Error::Exhausted`]
    /// when every member is busy, whatever the exhaustion policy, and with
    /// [`Error::PoolClosed`] after [`close`].
    ///
    /// [`close`]: Pool::close
    pub fn acquire_idle(&self) -> Result<Connection<S>, Error> {
        Self::first_idle(&self.inner.members.lock())
    }

    /// Returns an idle connection, applying the exhaustion policy.
    pub async fn acquire(&self) -> Result<Connection<S>, Error> {
        self.dispatch(Self::first_idle).await
    }

    /// Submits the request to an idle connection, without waiting.
    ///
    /// Picking the connection and marking it busy happen under the pool lock, so two
    /// callers never land on the same connection.
    pub fn submit<F>(&self, request: Request, continuation: F) -> Result<(), Error>
    where
        F: FnOnce(Result<Reply, Error>) + Send + 'static,
    {
        let members = self.inner.members.lock();
        Self::first_idle(&members)?.submit(request, continuation)
    }

    /// Sends the request through an idle connection, applying the exhaustion policy,
    /// and waits for the reply.
    pub async fn send(&self, request: Request) -> Result<Reply, Error> {
        let (tx, rx) = oneshot::channel();
        let continuation = move |result: Result<Reply, Error>| {
            let _ = tx.send(result);
        };
        let mut job = Some((request, continuation));
        self.dispatch(|members| {
            let conn = Self::first_idle(members)?;
            let (request, continuation) = job.take().ok_or(Error::ConnectionBusy)?;
            debug!(conn = conn.id(), "dispatching request");
            conn.submit(request, continuation)
        })
        .await?;
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Runs `attempt` against the members.
    ///
    /// Under [`Exhaustion::Wait`] an exhausted caller takes a ticket at the back of the
    /// wait queue. Only the caller at the front retries, each time a connection goes
    /// idle, and it keeps its place until it succeeds. Newcomers do not overtake a
    /// non-empty queue.
    async fn dispatch<T, F>(&self, mut attempt: F) -> Result<T, Error>
    where
        F: FnMut(&Members<S>) -> Result<T, Error>,
    {
        let ticket = {
            let mut members = self.inner.members.lock();
            let wait = self.inner.exhaustion == Exhaustion::Wait;
            if !wait || members.waiters.is_empty() {
                match attempt(&*members) {
                    Err(Error::Exhausted) if wait => {}
                    outcome => return outcome,
                }
            }
            members.enqueue()
        };
        let place = Place {
            inner: &self.inner,
            ticket,
        };
        debug!(ticket, "waiting for an idle connection");

        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                // register before looking so that a connection freed in between wakes us
                notified.as_mut().enable();

                let outcome = {
                    let mut members = self.inner.members.lock();
                    if members.closed {
                        Some(Err(Error::PoolClosed))
                    } else if members.waiters.front() != Some(&ticket) {
                        None
                    } else {
                        match attempt(&*members) {
                            Err(Error::Exhausted) => None,
                            outcome => {
                                members.waiters.pop_front();
                                Some(outcome)
                            }
                        }
                    }
                };
                match outcome {
                    Some(outcome) => return outcome,
                    None => notified.await,
                }
            }
        };
        let outcome = match self.inner.acquire_timeout {
            Some(timeout) => time::timeout(timeout, wait)
                .await
                .unwrap_or(Err(Error::AcquireTimeout)),
            None => wait.await,
        };
        drop(place);
        outcome
    }
}
