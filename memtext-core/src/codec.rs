//! Value encoding and decoding.
//!
//! Every entry stored through the text protocol travels with a 16-bit flags
//! word that records how the bytes were produced, so the client that reads
//! the entry back can reverse the process. The bit assignments are shared
//! with older clients; changing them corrupts caches written by those
//! clients.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::marker::PhantomData;

#[cfg(feature = "zlib")]
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use serde::{de::DeserializeOwned, Serialize};
#[cfg(feature = "zlib")]
use std::io::Write;

/// Marker for values produced by the injected object serializer.
pub const FLAG_SERIALIZED: u16 = 1;
/// Marker for zlib-compressed byte forms.
pub const FLAG_COMPRESSED: u16 = 1 << 1;
/// Marker for integers stored as decimal ASCII.
pub const FLAG_INTEGER: u16 = 1 << 2;
/// Legacy big-integer marker. Accepted on read for compatibility; never
/// produced on write.
pub const FLAG_LONG: u16 = 1 << 3;

const KNOWN_FLAGS: u16 = FLAG_SERIALIZED | FLAG_COMPRESSED | FLAG_INTEGER | FLAG_LONG;

/// Longest key the server accepts, prefix included.
pub const MAX_KEY_LENGTH: usize = 250;
/// Largest encoded value the client will send to a server (1 MiB - 1).
pub const MAX_VALUE_LENGTH: usize = 1_048_575;

/// An application value as seen by the client.
///
/// `Bytes`, `Text`, and `Int` are stored natively (flags 0 or `INTEGER`);
/// everything else goes through the configured [`Serializer`] as an
/// `Object`. Values written with flags 0 always read back as `Bytes`; the
/// equality impl below treats `Text` and byte-identical `Bytes` as equal so
/// round trips compare cleanly.
#[derive(Debug, Clone)]
pub enum Value<O = Infallible> {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Object(O),
}

impl<O> Value<O> {
    /// Byte view of `Bytes` and `Text` values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// UTF-8 view of `Bytes` and `Text` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl<O: PartialEq> PartialEq for Value<O> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Text(b)) | (Value::Text(b), Value::Bytes(a)) => {
                a.as_slice() == b.as_bytes()
            }
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl<O> From<&str> for Value<O> {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl<O> From<String> for Value<O> {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl<O> From<&[u8]> for Value<O> {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl<O> From<Vec<u8>> for Value<O> {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl<O> From<i64> for Value<O> {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl<O> From<i32> for Value<O> {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl<O> From<u32> for Value<O> {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

/// An error converting a value to or from its wire form. Codec errors never
/// touch the connection: writes report "not stored", reads report a miss.
#[derive(Debug)]
pub enum CodecError {
    /// Encoded form exceeds [`MAX_VALUE_LENGTH`].
    TooLarge(usize),
    /// The injected serializer failed on write.
    Serialize(String),
    /// The injected deserializer failed on read.
    Deserialize(String),
    /// The stored flags claim an encoding this client does not know.
    UnknownFlags(u16),
    /// Stored integer bytes were not decimal ASCII.
    BadInteger,
    /// Compression failed on write.
    Compress(String),
    /// `COMPRESSED` is set but the bytes would not decompress (or zlib
    /// support is compiled out).
    Decompress(String),
    /// Object values require an object serializer.
    NoObjectSupport,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CodecError::TooLarge(len) => {
                write!(f, "encoded value is {} bytes, max is {}", len, MAX_VALUE_LENGTH)
            }
            CodecError::Serialize(msg) => write!(f, "serialize: {}", msg),
            CodecError::Deserialize(msg) => write!(f, "deserialize: {}", msg),
            CodecError::UnknownFlags(flags) => write!(f, "unknown value flags {:#x}", flags),
            CodecError::BadInteger => write!(f, "stored integer is not decimal ASCII"),
            CodecError::Compress(msg) => write!(f, "compress: {}", msg),
            CodecError::Decompress(msg) => write!(f, "decompress: {}", msg),
            CodecError::NoObjectSupport => {
                write!(f, "object values require an object serializer")
            }
        }
    }
}

impl StdError for CodecError {}

/// Converts object values (anything that is not bytes, text, or an integer)
/// to and from their wire byte form. A default implementation is provided
/// for [`NoSerializer`], which refuses objects, and [`BincodeSerializer`].
///
/// If another wire format is desired it is possible to implement this trait
/// yourself and pass it into the client config.
pub trait Serializer: Clone + Send + Sync {
    /// The object type this serializer understands.
    type Object: Send;

    fn serialize(&self, value: &Self::Object) -> Result<Vec<u8>, CodecError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Object, CodecError>;
}

/// A serializer for clients that only store bytes, text, and integers.
/// Its object type is uninhabited, so `serialize` can never be reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSerializer;

impl Serializer for NoSerializer {
    type Object = Infallible;

    fn serialize(&self, value: &Infallible) -> Result<Vec<u8>, CodecError> {
        match *value {}
    }

    fn deserialize(&self, _bytes: &[u8]) -> Result<Infallible, CodecError> {
        Err(CodecError::NoObjectSupport)
    }
}

/// Serializes one serde-enabled object type with bincode.
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        BincodeSerializer { _marker: PhantomData }
    }
}

impl<T> std::fmt::Debug for BincodeSerializer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("BincodeSerializer")
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        BincodeSerializer { _marker: PhantomData }
    }
}

impl<T> Copy for BincodeSerializer<T> {}

impl<T> Serializer for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    type Object = T;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|err| CodecError::Serialize(err.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|err| CodecError::Deserialize(err.to_string()))
    }
}

/// Encode a value into its `(flags, bytes)` wire form.
///
/// When `min_compress_len` is non-zero, byte forms longer than it are run
/// through zlib and the compressed form is kept only if strictly smaller.
/// Integers are never compressed. Encodings longer than
/// [`MAX_VALUE_LENGTH`] are rejected; the server would refuse them anyway.
pub fn encode<S: Serializer>(
    value: &Value<S::Object>,
    serializer: &S,
    min_compress_len: usize,
) -> Result<(u16, Vec<u8>), CodecError> {
    let (flags, bytes, compressible) = match value {
        Value::Bytes(bytes) => (0, bytes.clone(), true),
        Value::Text(text) => (0, text.as_bytes().to_vec(), true),
        Value::Int(n) => (FLAG_INTEGER, n.to_string().into_bytes(), false),
        Value::Object(obj) => (FLAG_SERIALIZED, serializer.serialize(obj)?, true),
    };

    #[cfg(feature = "zlib")]
    let (flags, bytes) = maybe_compress(flags, bytes, compressible, min_compress_len)?;
    #[cfg(not(feature = "zlib"))]
    let _ = (compressible, min_compress_len);

    if bytes.len() > MAX_VALUE_LENGTH {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok((flags, bytes))
}

/// Decode a `(flags, bytes)` wire form back into a value.
pub fn decode<S: Serializer>(
    flags: u16,
    bytes: Vec<u8>,
    serializer: &S,
) -> Result<Value<S::Object>, CodecError> {
    if flags & !KNOWN_FLAGS != 0 {
        return Err(CodecError::UnknownFlags(flags));
    }

    let (flags, bytes) = if flags & FLAG_COMPRESSED != 0 {
        (flags & !FLAG_COMPRESSED, decompress(&bytes)?)
    } else {
        (flags, bytes)
    };

    if flags & (FLAG_INTEGER | FLAG_LONG) != 0 {
        let text = std::str::from_utf8(&bytes).map_err(|_| CodecError::BadInteger)?;
        let n = text.parse::<i64>().map_err(|_| CodecError::BadInteger)?;
        Ok(Value::Int(n))
    } else if flags & FLAG_SERIALIZED != 0 {
        Ok(Value::Object(serializer.deserialize(&bytes)?))
    } else {
        Ok(Value::Bytes(bytes))
    }
}

#[cfg(feature = "zlib")]
fn maybe_compress(
    flags: u16,
    bytes: Vec<u8>,
    compressible: bool,
    min_compress_len: usize,
) -> Result<(u16, Vec<u8>), CodecError> {
    if !compressible || min_compress_len == 0 || bytes.len() <= min_compress_len {
        return Ok((flags, bytes));
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&bytes)
        .map_err(|err| CodecError::Compress(err.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|err| CodecError::Compress(err.to_string()))?;
    if compressed.len() < bytes.len() {
        Ok((flags | FLAG_COMPRESSED, compressed))
    } else {
        // Compression made it bigger; keep the original.
        Ok((flags, bytes))
    }
}

#[cfg(feature = "zlib")]
fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder
        .write_all(bytes)
        .map_err(|err| CodecError::Decompress(err.to_string()))?;
    decoder
        .finish()
        .map_err(|err| CodecError::Decompress(err.to_string()))
}

#[cfg(not(feature = "zlib"))]
fn decompress(_bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Decompress("zlib support not compiled in".to_string()))
}
