//! A persistent connection carrying at most one request at a time.

use std::{fmt, io, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    net::TcpStream,
    runtime::Handle,
    sync::{oneshot, watch, Notify},
    time,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    frame::{Decoder, Reply},
    request::Request,
    Error,
};
use crate::shutdown::Shutdown;

/// Callback receiving the outcome of a submitted request. It is invoked exactly once,
/// with either the reply or the error that ended the exchange.
pub type Continuation = Box<dyn FnOnce(Result<Reply, Error>) + Send + 'static>;

/// Availability of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Ready to accept a request.
    Idle,
    /// A request is in flight.
    Busy,
    /// The transport is gone, the connection is never used again.
    Closed,
}

/// Sends requests to and receives [`Reply`] values from the server, one at a time.
///
/// Submitting a request marks the connection busy and spawns a task on the runtime
/// handle the connection was created with. The task writes the encoded request and
/// feeds whatever the transport delivers into the connection's [`Decoder`] until a
/// reply is complete. The connection goes back to idle *before* the continuation
/// runs, so a continuation may submit the next request right away.
///
/// A transport failure, a malformed reply or an expired request timeout closes the
/// connection for good; the pending continuation then receives the error.
///
/// [`Decoder`]: super::frame::Decoder
pub struct Connection<S = TcpStream> {
    shared: Arc<Shared<S>>,
}

/// Settings a pool hands down to each of its connections.
#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) handle: Handle,
    pub(crate) request_timeout: Option<Duration>,
    // woken whenever a connection goes back to idle or breaks
    pub(crate) idle: Arc<Notify>,
}

struct Shared<S> {
    id: usize,
    settings: Settings,
    closing: watch::Sender<bool>,
    state: Mutex<State<S>>,
}

struct State<S> {
    status: Status,
    // present if and only if the connection is busy
    pending: Option<Continuation>,
    // lent to the exchange task while a request is in flight
    io: Option<Io<S>>,
}

struct Io<S> {
    // wraps a stream inside a BufWriter to reduce the number of write syscalls
    stream: BufWriter<S>,
    decoder: Decoder,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<S> Connection<S> {
    /// Identifier of the connection within its pool.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Current availability.
    pub fn status(&self) -> Status {
        self.shared.state.lock().status
    }

    /// Returns `true` while a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.status() == Status::Busy
    }

    /// Returns `true` once the transport has been shut down.
    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    /// Returns `true` if a continuation is waiting for a reply.
    pub fn has_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    /// Shuts the connection down.
    ///
    /// An idle transport is dropped right away. An in-flight exchange is abandoned and
    /// its continuation receives [`Error::ConnectionClosed`]. Closing twice does nothing.
    pub fn close(&self) {
        let continuation = {
            let mut state = self.shared.state.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
            state.io = None;
            state.pending.take()
        };
        debug!(conn = self.shared.id, "connection closed");
        self.shared.closing.send_replace(true);
        self.shared.settings.idle.notify_waiters();
        if let Some(continuation) = continuation {
            continuation(Err(Error::ConnectionClosed));
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a connected transport. Exchanges are spawned on `handle`.
    pub fn new(stream: S, handle: Handle) -> Self {
        Self::with_settings(
            0,
            stream,
            Settings {
                handle,
                request_timeout: None,
                idle: Arc::new(Notify::new()),
            },
        )
    }

    pub(crate) fn with_settings(id: usize, stream: S, settings: Settings) -> Self {
        let (closing, _) = watch::channel(false);
        let io = Io {
            stream: BufWriter::new(stream),
            decoder: Decoder::new(),
        };
        Self {
            shared: Arc::new(Shared {
                id,
                settings,
                closing,
                state: Mutex::new(State {
                    status: Status::Idle,
                    pending: None,
                    io: Some(io),
                }),
            }),
        }
    }

    /// Sends the request and arranges for `continuation` to receive the reply.
    ///
    /// Fails with [`Error::ConnectionBusy`] if a request is already in flight and with
    /// [`Error::ConnectionClosed`] if the connection is closed. In both cases the
    /// continuation is dropped without being called.
    pub fn submit<F>(&self, request: Request, continuation: F) -> Result<(), Error>
    where
        F: FnOnce(Result<Reply, Error>) + Send + 'static,
    {
        let io = {
            let mut state = self.shared.state.lock();
            match state.status {
                Status::Busy => return Err(Error::ConnectionBusy),
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::Idle => {}
            }
            let io = state.io.take().ok_or(Error::ConnectionClosed)?;
            state.status = Status::Busy;
            state.pending = Some(Box::new(continuation));
            io
        };

        let span = debug_span!(
            "exchange",
            conn = self.shared.id,
            command = %String::from_utf8_lossy(request.command())
        );
        let shutdown = Shutdown::new(self.shared.closing.subscribe());
        let conn = self.clone();
        self.shared
            .settings
            .handle
            .spawn(conn.exchange(io, request, shutdown).instrument(span));
        Ok(())
    }

    /// Submits the request and waits for its reply.
    pub async fn send(&self, request: Request) -> Result<Reply, Error> {
        let (tx, rx) = oneshot::channel();
        self.submit(request, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    async fn exchange(self, mut io: Io<S>, request: Request, mut shutdown: Shutdown) {
        let outcome = if shutdown.is_shutdown() {
            Err(Error::ConnectionClosed)
        } else {
            tokio::select! {
                outcome = self.round_trip(&mut io, &request) => outcome,
                _ = shutdown.recv() => Err(Error::ConnectionClosed),
            }
        };
        self.finish(io, outcome);
    }

    async fn round_trip(&self, io: &mut Io<S>, request: &Request) -> Result<Reply, Error> {
        match self.shared.settings.request_timeout {
            Some(timeout) => time::timeout(timeout, io.round_trip(request))
                .await
                .unwrap_or(Err(Error::Timeout)),
            None => io.round_trip(request).await,
        }
    }

    fn finish(&self, io: Io<S>, outcome: Result<Reply, Error>) {
        // bytes past the reply would be taken as the answer to the next request
        let reusable = outcome.is_ok() && io.decoder.is_empty();
        let continuation = {
            let mut state = self.shared.state.lock();
            // A concurrent `close` has already answered the caller
            let Some(continuation) = state.pending.take() else {
                return;
            };
            match &outcome {
                Ok(_) if reusable => {
                    state.status = Status::Idle;
                    state.io = Some(io);
                }
                Ok(_) => {
                    warn!(
                        conn = self.shared.id,
                        "unsolicited bytes after reply, closing connection"
                    );
                    state.status = Status::Closed;
                    drop(io);
                }
                Err(error) => {
                    warn!(conn = self.shared.id, %error, "closing broken connection");
                    state.status = Status::Closed;
                    drop(io);
                }
            }
            continuation
        };

        if !reusable {
            self.shared.closing.send_replace(true);
        }
        self.shared.settings.idle.notify_waiters();
        continuation(outcome);
    }
}

impl<S> Io<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn round_trip(&mut self, request: &Request) -> Result<Reply, Error> {
        self.stream.write_all(&request.encode()).await?;
        self.stream.flush().await?;
        debug!(?request);

        loop {
            if let Some(reply) = self.decoder.gets()? {
                debug!(response = ?reply);
                return Ok(reply);
            }
            trace!(need = ?self.decoder.need(), "waiting for more bytes");
            if self.stream.read_buf(self.decoder.buffer_mut()).await? == 0 {
                // The server closed the socket in the middle of a reply
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by server",
                )
                .into());
            }
        }
    }
}
