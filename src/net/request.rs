//! Requests sent to the server, serialized as a RESP array of bulk strings.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::put_decimal;

/// A single binary-safe request argument.
///
/// Text is taken as its UTF-8 bytes and numbers as their decimal representation, so
/// lengths on the wire are always byte counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg(Bytes);

impl Arg {
    /// The raw bytes of the argument.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<&Bytes> for Arg {
    fn from(b: &Bytes) -> Self {
        Self(b.clone())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Self(b.into())
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(b: &[u8; N]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

macro_rules! arg_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(n: $t) -> Self {
                    Self(n.to_string().into())
                }
            }
        )*
    };
}

arg_from_integer!(i32, i64, u32, u64, usize);

/// An ordered sequence of arguments, the first one being the command name.
///
/// ```
/// use kvpool::Request;
///
/// let request = Request::new("SET").arg("a").arg("value");
/// assert_eq!(
///     &request.encode()[..],
///     b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$5\r\nvalue\r\n"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    args: Vec<Bytes>,
}

impl Request {
    /// Starts a request for the given command.
    pub fn new<A>(command: A) -> Self
    where
        A: Into<Arg>,
    {
        Self {
            args: vec![command.into().0],
        }
    }

    /// Appends an argument.
    pub fn arg<A>(mut self, arg: A) -> Self
    where
        A: Into<Arg>,
    {
        self.args.push(arg.into().0);
        self
    }

    /// Appends every argument of the iterator, in order.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(|a| a.into().0));
        self
    }

    /// The command name, empty for a request built from no arguments.
    pub fn command(&self) -> &[u8] {
        self.args.first().map(|c| &c[..]).unwrap_or_default()
    }

    /// Number of arguments, the command name included.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Returns `true` if the request carries no argument at all.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Iterates over the arguments.
    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.args.iter()
    }

    /// Serializes the request into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Appends `*<N>\r\n` followed by `$<len>\r\n<bytes>\r\n` for each argument.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(b'*');
        put_decimal(dst, self.args.len() as i64);
        dst.put_slice(b"\r\n");
        for arg in &self.args {
            dst.put_u8(b'$');
            put_decimal(dst, arg.len() as i64);
            dst.put_slice(b"\r\n");
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    // upper bound, 20 digits fit any length
    fn encoded_len(&self) -> usize {
        self.args.iter().map(|a| a.len() + 25).sum::<usize>() + 23
    }
}

impl<A> FromIterator<A> for Request
where
    A: Into<Arg>,
{
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().map(|a| a.into().0).collect(),
        }
    }
}
