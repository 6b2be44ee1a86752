//! In-memory server and transports used by the unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    runtime::Handle,
    sync::{Notify, Semaphore},
};

use super::{
    connection::{Connection, Settings},
    frame::{Decoder, Reply},
    pool::Connector,
};

enum Answer {
    Reply(Reply),
    // written one byte at a time
    Chunked(Reply),
    // written as is, then the connection is dropped
    Truncated(&'static [u8]),
    Raw(&'static [u8]),
    // answered once a permit is released
    Hold,
    Hangup,
}

/// A tiny key-value server speaking enough of the protocol for the tests.
///
/// Besides a handful of real commands it understands a few test hooks: `HOLD` only
/// answers once [`FakeServer::release`] grants it a permit, `NESTED` and `CHUNKY`
/// return nested arrays (the latter one byte at a time), `GARBAGE` answers with an
/// invalid reply, `STRAY` sends one reply too many, `HALF` hangs up in the middle of
/// a bulk string and `HANGUP` hangs up without answering.
pub(crate) struct FakeServer {
    data: Mutex<BTreeMap<Bytes, Bytes>>,
    ttls: Mutex<HashMap<Bytes, i64>>,
    hold: Semaphore,
}

impl FakeServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(BTreeMap::new()),
            ttls: Mutex::new(HashMap::new()),
            hold: Semaphore::new(0),
        })
    }

    /// Lets `n` held requests answer.
    pub(crate) fn release(&self, n: usize) {
        self.hold.add_permits(n);
    }

    pub(crate) async fn serve<S>(self: Arc<Self>, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut decoder = Decoder::new();
        while let Some(args) = read_request(&mut stream, &mut decoder).await {
            let mut out = BytesMut::new();
            let written = match self.answer(args) {
                Answer::Reply(reply) => {
                    reply.write_to(&mut out);
                    stream.write_all(&out).await
                }
                Answer::Chunked(reply) => {
                    reply.write_to(&mut out);
                    let mut written = Ok(());
                    for b in out.iter() {
                        written = stream.write_all(&[*b]).await;
                        if written.is_err() {
                            break;
                        }
                        let _ = stream.flush().await;
                        tokio::task::yield_now().await;
                    }
                    written
                }
                Answer::Raw(bytes) => stream.write_all(bytes).await,
                Answer::Hold => {
                    if let Ok(permit) = self.hold.acquire().await {
                        permit.forget();
                    }
                    ok().write_to(&mut out);
                    stream.write_all(&out).await
                }
                Answer::Truncated(bytes) => {
                    let _ = stream.write_all(bytes).await;
                    let _ = stream.flush().await;
                    return;
                }
                Answer::Hangup => return,
            };
            if written.is_err() || stream.flush().await.is_err() {
                return;
            }
        }
    }

    fn answer(&self, args: Vec<Bytes>) -> Answer {
        let name = match args.first() {
            Some(name) => String::from_utf8_lossy(name).to_uppercase(),
            None => return Answer::Reply(Reply::Error("ERR empty request".into())),
        };
        let args = &args[1..];
        let reply = match (name.as_str(), args) {
            ("PING", []) => Reply::Status("PONG".into()),
            ("GET", [key]) => self.data.lock().get(key).cloned().map_or(Reply::Null, Reply::Bulk),
            ("SET", [key, value]) => {
                self.data.lock().insert(key.clone(), value.clone());
                ok()
            }
            ("GETSET", [key, value]) => self
                .data
                .lock()
                .insert(key.clone(), value.clone())
                .map_or(Reply::Null, Reply::Bulk),
            ("DEL", keys) if !keys.is_empty() => {
                let mut data = self.data.lock();
                let removed = keys.iter().filter(|k| data.remove(*k).is_some()).count();
                Reply::Integer(removed as i64)
            }
            ("EXISTS", keys) if !keys.is_empty() => {
                let data = self.data.lock();
                Reply::Integer(keys.iter().filter(|k| data.contains_key(*k)).count() as i64)
            }
            ("INCR", [key]) => self.incr_by(key, 1),
            ("DECR", [key]) => self.incr_by(key, -1),
            ("INCRBY", [key, by]) | ("DECRBY", [key, by]) => match parse_i64(by) {
                Some(by) if name == "DECRBY" => self.incr_by(key, -by),
                Some(by) => self.incr_by(key, by),
                None => not_integer(),
            },
            ("MGET", keys) if !keys.is_empty() => {
                let data = self.data.lock();
                Reply::Array(
                    keys.iter()
                        .map(|k| data.get(k).cloned().map_or(Reply::Null, Reply::Bulk))
                        .collect(),
                )
            }
            ("MSET", pairs) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
                let mut data = self.data.lock();
                for pair in pairs.chunks(2) {
                    data.insert(pair[0].clone(), pair[1].clone());
                }
                ok()
            }
            ("STRLEN", [key]) => {
                Reply::Integer(self.data.lock().get(key).map_or(0, |v| v.len() as i64))
            }
            ("EXPIRE", [key, seconds]) => match parse_i64(seconds) {
                Some(seconds) if self.data.lock().contains_key(key) => {
                    self.ttls.lock().insert(key.clone(), seconds);
                    Reply::Integer(1)
                }
                Some(_) => Reply::Integer(0),
                None => not_integer(),
            },
            ("TTL", [key]) => {
                if self.data.lock().contains_key(key) {
                    Reply::Integer(self.ttls.lock().get(key).copied().unwrap_or(-1))
                } else {
                    Reply::Integer(-2)
                }
            }
            ("KEYS", [pattern]) if &pattern[..] == b"*" => {
                Reply::Array(self.data.lock().keys().cloned().map(Reply::Bulk).collect())
            }
            ("NESTED", []) => nested(),
            ("CHUNKY", []) => return Answer::Chunked(nested()),
            ("HOLD", []) => return Answer::Hold,
            ("GARBAGE", []) => return Answer::Raw(b"?garbage\r\n"),
            ("STRAY", []) => return Answer::Raw(b"+OK\r\n+STRAY\r\n"),
            ("HALF", []) => return Answer::Truncated(b"$10\r\nhalf"),
            ("HANGUP", []) => return Answer::Hangup,
            _ => Reply::Error(format!("ERR unknown command or arity '{}'", name)),
        };
        Answer::Reply(reply)
    }

    fn incr_by(&self, key: &Bytes, by: i64) -> Reply {
        let mut data = self.data.lock();
        let current = match data.get(key) {
            Some(value) => match parse_i64(value) {
                Some(n) => n,
                None => return not_integer(),
            },
            None => 0,
        };
        match current.checked_add(by) {
            Some(n) => {
                data.insert(key.clone(), n.to_string().into());
                Reply::Integer(n)
            }
            None => not_integer(),
        }
    }
}

/// The reply of the `NESTED` and `CHUNKY` test commands.
pub(crate) fn nested() -> Reply {
    Reply::Array(vec![
        Reply::Integer(1),
        Reply::Array(vec![Reply::Bulk("a\r\nb".into()), Reply::Null]),
        Reply::Array(vec![]),
        Reply::Status("done".into()),
    ])
}

fn ok() -> Reply {
    Reply::Status("OK".into())
}

fn not_integer() -> Reply {
    Reply::Error("ERR value is not an integer or out of range".into())
}

fn parse_i64(b: &[u8]) -> Option<i64> {
    std::str::from_utf8(b).ok()?.parse().ok()
}

async fn read_request<S>(stream: &mut S, decoder: &mut Decoder) -> Option<Vec<Bytes>>
where
    S: AsyncRead + Unpin,
{
    loop {
        match decoder.gets() {
            Ok(Some(Reply::Array(items))) => {
                return Some(
                    items
                        .into_iter()
                        .filter_map(|item| match item {
                            Reply::Bulk(b) => Some(b),
                            _ => None,
                        })
                        .collect(),
                )
            }
            Ok(Some(_)) | Err(_) => return None,
            Ok(None) => {}
        }
        match stream.read_buf(decoder.buffer_mut()).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Opens in-memory transports served by a [`FakeServer`].
pub(crate) struct DuplexConnector {
    server: Arc<FakeServer>,
    refuse_at: Option<usize>,
    attempts: AtomicUsize,
}

impl DuplexConnector {
    pub(crate) fn new(server: &Arc<FakeServer>) -> Self {
        Self {
            server: server.clone(),
            refuse_at: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// A connector whose `n`-th attempt (counting from zero) is refused.
    pub(crate) fn refusing_at(server: &Arc<FakeServer>, n: usize) -> Self {
        Self {
            refuse_at: Some(n),
            ..Self::new(server)
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self.refuse_at == Some(attempt);
        let server = self.server.clone();
        async move {
            if refused {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ));
            }
            let (client, remote) = duplex(64 * 1024);
            tokio::spawn(server.serve(remote));
            Ok(client)
        }
    }
}

/// A standalone connection to the server, outside of any pool.
pub(crate) fn connection(
    server: &Arc<FakeServer>,
    request_timeout: Option<Duration>,
) -> Connection<DuplexStream> {
    let (client, remote) = duplex(64 * 1024);
    tokio::spawn(server.clone().serve(remote));
    Connection::with_settings(
        0,
        client,
        Settings {
            handle: Handle::current(),
            request_timeout,
            idle: Arc::new(Notify::new()),
        },
    )
}
