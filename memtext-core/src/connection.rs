//! One connection per configured server: endpoint parsing, the socket
//! lifecycle with dead-server blacklisting, and the low-level line-oriented
//! I/O the protocol exchanges are built from.
//!
//! Reads go through a byte accumulator refilled in fixed-size chunks, so
//! response parsing never assumes anything about how TCP fragments the
//! stream.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;

use crate::client::Error;

/// Seconds before a dead server is dialed again.
pub const DEAD_RETRY: Duration = Duration::from_secs(30);
/// Per-call socket timeout.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(3);

const DEFAULT_PORT: u16 = 11211;
const RECV_CHUNK: usize = 4096;

/// A parsed server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Inet { host: String, port: u16 },
    Inet6 { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl FromStr for ServerAddr {
    type Err = Error;

    /// Parse an endpoint string. Accepted forms, tried in order:
    /// `unix:<path>`, `inet6:[<host>]:<port>?`, `inet:<host>:<port>?`,
    /// `<host>:<port>?`. The port defaults to 11211.
    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = || Error::BadServer(s.to_string());

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(bad());
            }
            return Ok(ServerAddr::Unix { path: PathBuf::from(path) });
        }
        if let Some(rest) = s.strip_prefix("inet6:") {
            let rest = rest.strip_prefix('[').ok_or_else(bad)?;
            let close = rest.find(']').ok_or_else(bad)?;
            let host = &rest[..close];
            if host.is_empty() {
                return Err(bad());
            }
            let tail = &rest[close + 1..];
            let port = if tail.is_empty() {
                DEFAULT_PORT
            } else {
                tail.strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(bad)?
            };
            return Ok(ServerAddr::Inet6 { host: host.to_string(), port });
        }

        let rest = s.strip_prefix("inet:").unwrap_or(s);
        let (host, port) = match rest.find(':') {
            Some(index) => {
                let port = rest[index + 1..].parse().map_err(|_| bad())?;
                (&rest[..index], port)
            }
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(bad());
        }
        Ok(ServerAddr::Inet { host: host.to_string(), port })
    }
}

impl Display for ServerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ServerAddr::Inet { host, port } => write!(f, "inet:{}:{}", host, port),
            ServerAddr::Inet6 { host, port } => write!(f, "inet6:[{}]:{}", host, port),
            ServerAddr::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// One configured endpoint: the unparsed address string plus its bucket
/// weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub addr: String,
    pub weight: u32,
}

impl From<&str> for ServerSpec {
    fn from(addr: &str) -> Self {
        ServerSpec { addr: addr.to_string(), weight: 1 }
    }
}

impl From<String> for ServerSpec {
    fn from(addr: String) -> Self {
        ServerSpec { addr, weight: 1 }
    }
}

impl From<(&str, u32)> for ServerSpec {
    fn from((addr, weight): (&str, u32)) -> Self {
        ServerSpec { addr: addr.to_string(), weight }
    }
}

impl From<(String, u32)> for ServerSpec {
    fn from((addr, weight): (String, u32)) -> Self {
        ServerSpec { addr, weight }
    }
}

/// A raw async byte stream to one server. Concrete implementations live in
/// runtime crates (e.g. tokio or async-std); the core only needs
/// connect/read/write.
#[async_trait]
pub trait Transport: Send + Sized + 'static {
    /// Open a stream to `addr`, giving up after `timeout`. Implementations
    /// apply the same timeout to every subsequent read and write.
    async fn connect(addr: &ServerAddr, timeout: Duration) -> io::Result<Self>;

    /// Read whatever is available into `buf`, returning the byte count.
    /// Zero means the remote closed the stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data`.
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// A response that desynchronizes the stream. The connection is marked dead
/// when one of these is raised; the bytes following it can no longer be
/// trusted to line up with requests.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Stream ended inside a value body.
    UnexpectedEof { expected: usize, read: usize },
    /// A `VALUE` header line that does not parse.
    InvalidValueHeader(String),
    /// Value body not terminated by CRLF.
    MissingTerminator,
    /// A response line no handler recognizes.
    UnexpectedResponse(String),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ProtocolError::UnexpectedEof { expected, read } => {
                write!(f, "read {} bytes, expecting {}", read, expected)
            }
            ProtocolError::InvalidValueHeader(line) => {
                write!(f, "invalid VALUE header: {:?}", line)
            }
            ProtocolError::MissingTerminator => write!(f, "value body missing CRLF terminator"),
            ProtocolError::UnexpectedResponse(line) => {
                write!(f, "unexpected response: {:?}", line)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parsed `VALUE <key> <flags> <len> [<cas>]` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader {
    pub key: Vec<u8>,
    pub flags: u16,
    pub len: usize,
    pub cas: Option<u64>,
}

/// Parse a `VALUE` header without a CAS token (`get` responses). Lines that
/// are not `VALUE` headers (typically the bare `END` of a miss) yield
/// `None`.
pub fn parse_value_header(line: &[u8]) -> Result<Option<ValueHeader>, ProtocolError> {
    parse_header(line, false)
}

/// Parse a `VALUE` header with a CAS token (`gets` responses).
pub fn parse_cas_value_header(line: &[u8]) -> Result<Option<ValueHeader>, ProtocolError> {
    parse_header(line, true)
}

fn parse_header(line: &[u8], want_cas: bool) -> Result<Option<ValueHeader>, ProtocolError> {
    if !line.starts_with(b"VALUE ") {
        return Ok(None);
    }
    let bad = || ProtocolError::InvalidValueHeader(String::from_utf8_lossy(line).into_owned());

    let mut parts = line.split(|&byte| byte == b' ');
    let _verb = parts.next();
    let key = parts.next().ok_or_else(bad)?.to_vec();
    let flags = parse_ascii::<u16>(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
    let len = parse_ascii::<usize>(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
    let cas = if want_cas {
        Some(parse_ascii::<u64>(parts.next().ok_or_else(bad)?).ok_or_else(bad)?)
    } else {
        None
    };
    Ok(Some(ValueHeader { key, flags, len, cas }))
}

fn parse_ascii<T: FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

/// Connection-level knobs, shared by every connection a client builds.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub dead_retry: Duration,
    pub socket_timeout: Duration,
    pub flush_on_reconnect: bool,
}

/// One server's connection: address, liveness state, and buffered I/O.
///
/// The socket is opened lazily by [`Connection::connect`] and destroyed by
/// any error, [`Connection::mark_dead`], or an explicit close. While
/// `dead_until` is in the future, connect attempts short-circuit to failure
/// without touching the network.
pub struct Connection<C> {
    addr: ServerAddr,
    weight: u32,
    dead_retry: Duration,
    socket_timeout: Duration,
    flush_on_reconnect: bool,
    transport: Option<C>,
    rx: BytesMut,
    dead_until: Option<Instant>,
    flush_on_next_connect: bool,
}

impl<C> Connection<C> {
    pub(crate) fn new(spec: &ServerSpec, settings: &ConnectionSettings) -> Result<Self, Error> {
        if spec.weight == 0 {
            return Err(Error::BadServer(format!("{} (weight must be positive)", spec.addr)));
        }
        Ok(Connection {
            addr: spec.addr.parse()?,
            weight: spec.weight,
            dead_retry: settings.dead_retry,
            socket_timeout: settings.socket_timeout,
            flush_on_reconnect: settings.flush_on_reconnect,
            transport: None,
            rx: BytesMut::new(),
            dead_until: None,
            flush_on_next_connect: false,
        })
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn dead_until(&self) -> Option<Instant> {
        self.dead_until
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Printable identifier for stats reporting.
    pub fn name(&self) -> String {
        match &self.addr {
            ServerAddr::Inet { host, port } => format!("{}:{} ({})", host, port, self.weight),
            ServerAddr::Inet6 { host, port } => format!("[{}]:{} ({})", host, port, self.weight),
            ServerAddr::Unix { path } => format!("unix:{} ({})", path.display(), self.weight),
        }
    }

    /// Blacklist this server for `dead_retry` and drop the socket. When the
    /// client opted into flush-on-reconnect, the next successful connect
    /// will flush the server before carrying user commands, so a restarted
    /// server cannot serve entries that were updated elsewhere while it was
    /// out of rotation.
    pub fn mark_dead(&mut self, reason: &str) {
        tracing::warn!(server = %self.addr, reason, "marking server dead");
        self.dead_until = Some(Instant::now() + self.dead_retry);
        if self.flush_on_reconnect {
            self.flush_on_next_connect = true;
        }
        self.close();
    }

    /// Drop the socket without blacklisting.
    pub fn close(&mut self) {
        self.transport = None;
    }

    pub(crate) fn revive(&mut self) {
        self.dead_until = None;
    }

    fn check_dead(&mut self) -> bool {
        match self.dead_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.dead_until = None;
                false
            }
            None => false,
        }
    }
}

impl<C: Transport> Connection<C> {
    /// Ensure there is a live transport, dialing one if needed. Returns
    /// false while the server is blacklisted or the dial fails.
    pub async fn connect(&mut self) -> bool {
        if self.check_dead() {
            return false;
        }
        if self.transport.is_some() {
            return true;
        }
        match C::connect(&self.addr, self.socket_timeout).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.rx.clear();
                if self.flush_on_next_connect {
                    if self.flush().await.is_err() {
                        return false;
                    }
                    self.flush_on_next_connect = false;
                }
                true
            }
            Err(err) => {
                self.mark_dead(&format!("connect: {}", err));
                false
            }
        }
    }

    /// Send one command line; the CRLF terminator is appended here.
    pub async fn send_one(&mut self, cmd: &[u8]) -> Result<(), Error> {
        let mut frame = Vec::with_capacity(cmd.len() + 2);
        frame.extend_from_slice(cmd);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await
    }

    /// Send pre-framed bytes; every frame must already carry its CRLF.
    pub async fn send(&mut self, frames: &[u8]) -> Result<(), Error> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                self.mark_dead("send on closed connection");
                return Err(Error::ConnectionDead);
            }
        };
        if let Err(err) = transport.write_all(frames).await {
            self.mark_dead(&format!("send: {}", err));
            return Err(Error::Io(err));
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), Error> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                self.mark_dead("read on closed connection");
                return Err(Error::ConnectionDead);
            }
        };
        let mut chunk = [0u8; RECV_CHUNK];
        match transport.read(&mut chunk).await {
            Ok(0) => {
                self.mark_dead("connection closed by server");
                Err(Error::ConnectionDead)
            }
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(err) => {
                self.mark_dead(&format!("recv: {}", err));
                Err(Error::Io(err))
            }
        }
    }

    /// Read one CRLF-terminated line; the terminator is consumed but not
    /// returned. A remote close at a line boundary raises
    /// [`Error::ConnectionDead`], the one transport error worth a reconnect.
    pub async fn readline(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(pos) = find_crlf(&self.rx) {
                let mut line = self.rx.split_to(pos + 2).to_vec();
                line.truncate(pos);
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    /// Read exactly `n` bytes. EOF mid-body is a protocol error, unlike EOF
    /// at a line boundary: requests and responses no longer line up.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        while self.rx.len() < n {
            match self.fill().await {
                Ok(()) => {}
                Err(Error::ConnectionDead) => {
                    return Err(Error::Protocol(ProtocolError::UnexpectedEof {
                        expected: n,
                        read: self.rx.len(),
                    }));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.rx.split_to(n).to_vec())
    }

    /// Read a `len`-byte value body plus its CRLF trailer.
    pub async fn read_value_body(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut body = self.recv_exact(len + 2).await?;
        if &body[len..] != b"\r\n" {
            self.mark_dead("value body missing CRLF trailer");
            return Err(Error::Protocol(ProtocolError::MissingTerminator));
        }
        body.truncate(len);
        Ok(body)
    }

    /// Read one line, logging when it differs from `expected`. The line is
    /// returned either way; callers decide what a mismatch means.
    pub async fn expect(&mut self, expected: &[u8]) -> Result<Vec<u8>, Error> {
        let line = self.readline().await?;
        if line != expected {
            tracing::debug!(
                server = %self.addr,
                expected = %String::from_utf8_lossy(expected),
                got = %String::from_utf8_lossy(&line),
                "unexpected response"
            );
        }
        Ok(line)
    }

    /// Wipe everything on this server. Used directly and as the stale-data
    /// guard on reconnect.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.send_one(b"flush_all").await?;
        self.expect(b"OK").await?;
        Ok(())
    }

    /// Liveness probe; returns the server's version string.
    pub async fn version(&mut self) -> Result<Vec<u8>, Error> {
        self.send_one(b"version").await?;
        let line = self.readline().await?;
        match line.strip_prefix(b"VERSION ") {
            Some(version) => Ok(version.to_vec()),
            None => {
                self.mark_dead("bad version response");
                Err(Error::Protocol(ProtocolError::UnexpectedResponse(
                    String::from_utf8_lossy(&line).into_owned(),
                )))
            }
        }
    }
}

impl<C> Display for Connection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.addr)?;
        if let Some(until) = self.dead_until {
            let now = Instant::now();
            if until > now {
                write!(f, " (dead for another {}s)", (until - now).as_secs())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockTransport};
    use tokio_test::block_on;

    fn test_conn(addr: &str) -> Connection<MockTransport> {
        test_conn_with(addr, DEAD_RETRY, false)
    }

    fn test_conn_with(
        addr: &str,
        dead_retry: Duration,
        flush_on_reconnect: bool,
    ) -> Connection<MockTransport> {
        let settings = ConnectionSettings {
            dead_retry,
            socket_timeout: SOCKET_TIMEOUT,
            flush_on_reconnect,
        };
        Connection::new(&ServerSpec::from(addr), &settings).unwrap()
    }

    #[test]
    fn test_parse_inet() {
        assert_eq!(
            ServerAddr::Inet { host: "127.0.0.1".to_string(), port: 11211 },
            "127.0.0.1:11211".parse().unwrap()
        );
        assert_eq!(
            ServerAddr::Inet { host: "cache.local".to_string(), port: 11211 },
            "cache.local".parse().unwrap()
        );
        assert_eq!(
            ServerAddr::Inet { host: "cache.local".to_string(), port: 5000 },
            "inet:cache.local:5000".parse().unwrap()
        );
        assert!("".parse::<ServerAddr>().is_err());
        assert!("host:".parse::<ServerAddr>().is_err());
        assert!("host:1:2".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn test_parse_inet6() {
        assert_eq!(
            ServerAddr::Inet6 { host: "::1".to_string(), port: 11211 },
            "inet6:[::1]".parse().unwrap()
        );
        assert_eq!(
            ServerAddr::Inet6 { host: "::1".to_string(), port: 5000 },
            "inet6:[::1]:5000".parse().unwrap()
        );
        assert!("inet6:::1".parse::<ServerAddr>().is_err());
        assert!("inet6:[]".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            ServerAddr::Unix { path: PathBuf::from("/tmp/memcached.sock") },
            "unix:/tmp/memcached.sock".parse().unwrap()
        );
        assert!("unix:".parse::<ServerAddr>().is_err());
    }

    #[test]
    fn test_weight_must_be_positive() {
        let settings = ConnectionSettings {
            dead_retry: DEAD_RETRY,
            socket_timeout: SOCKET_TIMEOUT,
            flush_on_reconnect: false,
        };
        let spec = ServerSpec::from(("localhost", 0));
        assert!(Connection::<MockTransport>::new(&spec, &settings).is_err());
    }

    #[test]
    fn test_value_header_parsing() {
        let header = parse_value_header(b"VALUE some_key 4 10").unwrap().unwrap();
        assert_eq!(b"some_key".to_vec(), header.key);
        assert_eq!(4, header.flags);
        assert_eq!(10, header.len);
        assert_eq!(None, header.cas);

        let header = parse_cas_value_header(b"VALUE k 0 3 99").unwrap().unwrap();
        assert_eq!(Some(99), header.cas);

        assert_eq!(None, parse_value_header(b"END").unwrap());
        assert!(parse_value_header(b"VALUE k x 10").is_err());
        assert!(parse_cas_value_header(b"VALUE k 0 3").is_err());
    }

    #[test]
    fn test_readline_tolerates_fragmentation() {
        testing::reset();
        testing::script(
            "inet:frag:11211",
            &[b"VAL", b"UE k 0 ", b"5\r", b"\nhello\r\nEND\r\n"],
        );
        block_on(async {
            let mut conn = test_conn("frag");
            assert!(conn.connect().await);
            assert_eq!(b"VALUE k 0 5".to_vec(), conn.readline().await.unwrap());
            assert_eq!(b"hello".to_vec(), conn.read_value_body(5).await.unwrap());
            assert_eq!(b"END".to_vec(), conn.readline().await.unwrap());
        });
    }

    #[test]
    fn test_readline_eof_marks_dead() {
        testing::reset();
        testing::script("inet:eof:11211", &[]);
        block_on(async {
            let mut conn = test_conn("eof");
            assert!(conn.connect().await);
            match conn.readline().await {
                Err(Error::ConnectionDead) => {}
                other => panic!("expected ConnectionDead, got {:?}", other),
            }
            assert!(conn.dead_until().is_some());
            assert!(!conn.is_connected());
        });
    }

    #[test]
    fn test_recv_exact_eof_is_protocol_error() {
        testing::reset();
        testing::script("inet:trunc:11211", &[b"hel"]);
        block_on(async {
            let mut conn = test_conn("trunc");
            assert!(conn.connect().await);
            match conn.recv_exact(5).await {
                Err(Error::Protocol(ProtocolError::UnexpectedEof { expected: 5, read: 3 })) => {}
                other => panic!("expected UnexpectedEof, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_send_one_appends_crlf() {
        testing::reset();
        block_on(async {
            let mut conn = test_conn("send");
            assert!(conn.connect().await);
            conn.send_one(b"get key").await.unwrap();
            assert_eq!(b"get key\r\n".to_vec(), testing::sent("inet:send:11211"));
        });
    }

    #[test]
    fn test_dead_until_gates_connect() {
        testing::reset();
        testing::refuse("inet:down:11211");
        block_on(async {
            let mut conn = test_conn("down");
            assert!(!conn.connect().await);
            assert_eq!(1, testing::connect_attempts("inet:down:11211"));
            // Blacklisted: no further dials until dead_retry passes.
            assert!(!conn.connect().await);
            assert!(!conn.connect().await);
            assert_eq!(1, testing::connect_attempts("inet:down:11211"));
        });
    }

    #[test]
    fn test_dead_retry_elapsed_allows_reconnect() {
        testing::reset();
        block_on(async {
            let mut conn = test_conn_with("back", Duration::from_nanos(0), false);
            conn.mark_dead("test");
            // dead_until == the mark instant, which is already in the past.
            assert!(conn.connect().await);
            assert!(conn.is_connected());
        });
    }

    #[test]
    fn test_flush_on_reconnect() {
        testing::reset();
        testing::script("inet:stale:11211", &[b"OK\r\n"]);
        block_on(async {
            let mut conn = test_conn_with("stale", Duration::from_nanos(0), true);
            assert!(conn.connect().await);
            conn.mark_dead("test");
            assert!(conn.connect().await);
            // The reconnect flushed the server before anything else.
            assert_eq!(b"flush_all\r\n".to_vec(), testing::sent("inet:stale:11211"));

            // The flag does not stick to later reconnects.
            conn.close();
            assert!(conn.connect().await);
            assert_eq!(b"flush_all\r\n".to_vec(), testing::sent("inet:stale:11211"));
        });
    }

    #[test]
    fn test_version() {
        testing::reset();
        testing::script("inet:ver:11211", &[b"VERSION 1.6.21\r\n"]);
        block_on(async {
            let mut conn = test_conn("ver");
            assert!(conn.connect().await);
            assert_eq!(b"1.6.21".to_vec(), conn.version().await.unwrap());
        });
    }

    #[test]
    fn test_display() {
        let conn = test_conn("127.0.0.1:11211");
        assert_eq!("inet:127.0.0.1:11211", format!("{}", conn));
        let mut conn = conn;
        conn.mark_dead("test");
        assert!(format!("{}", conn).starts_with("inet:127.0.0.1:11211 (dead"));
    }
}
