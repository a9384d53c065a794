//! A memcached text-protocol client using tokio for async I/O.
//!
//! The runtime-agnostic client lives in `memtext-core`; this crate supplies
//! the [`TokioTransport`] that dials TCP and UNIX-domain sockets and applies
//! the configured socket timeout to every connect, read, and write. For
//! example:
//!
//! ```ignore
//! use memtext_tokio::{Client, ClientConfig, StoreOptions, TokioClient, NoSerializer};
//!
//! let config = ClientConfig::new_primitive(vec!["localhost:11211"]);
//! let mut client: TokioClient<NoSerializer> = Client::new(config)?;
//! client.set("some_key", "some value", StoreOptions::new(0)).await?;
//! ```

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use memtext_core::connection::{ServerAddr, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;

pub use memtext_core::client::{
    Client, ClientConfig, ClientManager, ClientPool, Error, StoreOptions,
};
pub use memtext_core::codec::{BincodeSerializer, NoSerializer, Serializer, Value};
pub use memtext_core::key::{IntoKey, Key, KeyError};

/// A client over tokio sockets.
pub type TokioClient<S> = Client<TokioTransport, S>;

/// A pool of tokio clients. Use this to balance operations across a bounded
/// number of ready clients:
///
/// ```ignore
/// use memtext_tokio::{ClientConfig, ClientManager, Pool};
///
/// let config = ClientConfig::new_primitive(vec!["localhost:11211"]);
/// let pool: Pool<_> = Pool::builder(ClientManager::new(config))
///     .max_size(16)
///     .build()
///     .unwrap();
/// ```
pub type Pool<S> = ClientPool<TokioTransport, S>;

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A [`Transport`] over tokio TCP or UNIX-domain sockets.
pub struct TokioTransport {
    stream: Stream,
    timeout: Duration,
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "socket timeout")),
    }
}

#[cfg(unix)]
async fn connect_unix(path: &Path, limit: Duration) -> io::Result<Stream> {
    Ok(Stream::Unix(bounded(limit, UnixStream::connect(path)).await?))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &Path, _limit: Duration) -> io::Result<Stream> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        "unix sockets are not supported on this platform",
    ))
}

#[async_trait]
impl Transport for TokioTransport {
    async fn connect(addr: &ServerAddr, limit: Duration) -> io::Result<Self> {
        let stream = match addr {
            ServerAddr::Inet { host, port } | ServerAddr::Inet6 { host, port } => {
                Stream::Tcp(bounded(limit, TcpStream::connect((host.as_str(), *port))).await?)
            }
            ServerAddr::Unix { path } => connect_unix(path, limit).await?,
        };
        Ok(TokioTransport { stream, timeout: limit })
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Tcp(stream) => bounded(self.timeout, stream.read(buf)).await,
            #[cfg(unix)]
            Stream::Unix(stream) => bounded(self.timeout, stream.read(buf)).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Stream::Tcp(stream) => bounded(self.timeout, stream.write_all(data)).await,
            #[cfg(unix)]
            Stream::Unix(stream) => bounded(self.timeout, stream.write_all(data)).await,
        }
    }
}
