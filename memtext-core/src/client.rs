//! The high-level client: key validation, server selection, the
//! per-operation request/response exchanges, multi-key fan-out, and CAS
//! bookkeeping.
//!
//! Operations borrow the client mutably, so one client never runs two
//! exchanges on the same connection at once; share load through a
//! [`ClientPool`] instead.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Manager, RecycleError, RecycleResult};

use crate::codec::{self, CodecError, NoSerializer, Serializer, Value};
use crate::connection::{
    parse_cas_value_header, parse_value_header, Connection, ConnectionSettings, ProtocolError,
    ServerSpec, Transport, DEAD_RETRY, SOCKET_TIMEOUT,
};
use crate::key::{check_key, IntoKey, Key, KeyError};
use crate::pool::Pool;

/// An error raised by client operations.
///
/// Only `BadKey` (and `BadServer`, at construction) reach callers through
/// the normal operation paths: a rejected key is a programming error. The
/// transport and protocol variants exist for the internal exchange
/// plumbing; at the public surface they collapse into `false`/`None`
/// results after the connection has been blacklisted.
#[derive(Debug)]
pub enum Error {
    /// The caller-supplied key failed validation.
    BadKey(KeyError),
    /// An endpoint string could not be parsed, or carried a zero weight.
    BadServer(String),
    /// The remote closed the stream at a frame boundary.
    ConnectionDead,
    /// A socket-level failure, including timeouts.
    Io(std::io::Error),
    /// The response stream is desynchronized.
    Protocol(ProtocolError),
    /// Value encoding or decoding failed.
    Codec(CodecError),
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        Self::BadKey(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::BadKey(err) => write!(f, "bad key: {}", err),
            Error::BadServer(server) => {
                write!(f, "unable to parse connection string: {:?}", server)
            }
            Error::ConnectionDead => write!(f, "connection dead"),
            Error::Io(err) => write!(f, "io: {}", err),
            Error::Protocol(err) => write!(f, "protocol: {}", err),
            Error::Codec(err) => write!(f, "codec: {}", err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::BadKey(err) => Some(err),
            Error::BadServer(_) => None,
            Error::ConnectionDead => None,
            Error::Io(err) => Some(err),
            Error::Protocol(err) => Some(err),
            Error::Codec(err) => Some(err),
        }
    }
}

/// Per-write knobs shared by every storage verb.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Expiration in seconds; 0 means never. Values past 30 days are read
    /// by memcached as absolute unix timestamps.
    pub expire: u32,
    /// Overrides the client-wide compression threshold for this write.
    pub min_compress_len: Option<usize>,
    /// Ask the server not to send the status line and assume success.
    pub noreply: bool,
}

impl StoreOptions {
    pub fn new(expire: u32) -> Self {
        StoreOptions { expire, ..StoreOptions::default() }
    }

    pub fn with_min_compress_len(mut self, len: usize) -> Self {
        self.min_compress_len = Some(len);
        self
    }

    pub fn with_noreply(mut self) -> Self {
        self.noreply = true;
        self
    }
}

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig<S: Serializer> {
    servers: Vec<ServerSpec>,
    dead_retry: Duration,
    socket_timeout: Duration,
    flush_on_reconnect: bool,
    cache_cas: bool,
    min_compress_len: usize,
    serializer: S,
}

impl<S: Serializer> ClientConfig<S> {
    /// Create a new client config from the given servers and object
    /// serializer. Servers may be plain endpoint strings or
    /// `(endpoint, weight)` pairs.
    pub fn new<T: Into<ServerSpec>>(servers: Vec<T>, serializer: S) -> Self {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            dead_retry: DEAD_RETRY,
            socket_timeout: SOCKET_TIMEOUT,
            flush_on_reconnect: false,
            cache_cas: false,
            min_compress_len: 0,
            serializer,
        }
    }

    /// Seconds before a dead server is dialed again.
    pub fn dead_retry(mut self, value: Duration) -> Self {
        self.dead_retry = value;
        self
    }

    /// Timeout applied to every connect, read, and write.
    pub fn socket_timeout(mut self, value: Duration) -> Self {
        self.socket_timeout = value;
        self
    }

    /// Flush a dead server on its first reconnect. Guards against reading
    /// entries that went stale while their keys were rehashed to another
    /// server.
    pub fn flush_on_reconnect(mut self, value: bool) -> Self {
        self.flush_on_reconnect = value;
        self
    }

    /// Record CAS tokens from `gets` for later `cas` calls. The token map
    /// grows without bound until [`Client::reset_cas`] is called.
    pub fn cache_cas(mut self, value: bool) -> Self {
        self.cache_cas = value;
        self
    }

    /// Compress values longer than this many bytes; 0 disables compression.
    pub fn min_compress_len(mut self, value: usize) -> Self {
        self.min_compress_len = value;
        self
    }
}

impl ClientConfig<NoSerializer> {
    /// Config for clients that only store bytes, text, and integers.
    pub fn new_primitive<T: Into<ServerSpec>>(servers: Vec<T>) -> Self {
        ClientConfig::new(servers, NoSerializer)
    }
}

/// A client sharding keys over a fixed set of memcached servers.
pub struct Client<C: Transport, S: Serializer> {
    pool: Pool<C>,
    serializer: S,
    cache_cas: bool,
    min_compress_len: usize,
    cas_ids: HashMap<Vec<u8>, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreVerb {
    fn token(self) -> &'static [u8] {
        match self {
            StoreVerb::Set => b"set",
            StoreVerb::Add => b"add",
            StoreVerb::Replace => b"replace",
            StoreVerb::Append => b"append",
            StoreVerb::Prepend => b"prepend",
            StoreVerb::Cas => b"cas",
        }
    }
}

struct MultiEntry<P> {
    wire_key: Vec<u8>,
    orig_key: Vec<u8>,
    payload: P,
}

impl<C: Transport, S: Serializer> Client<C, S> {
    /// Build a client from the config. No sockets are opened here;
    /// connections dial on first use.
    pub fn new(config: ClientConfig<S>) -> Result<Self, Error> {
        let settings = ConnectionSettings {
            dead_retry: config.dead_retry,
            socket_timeout: config.socket_timeout,
            flush_on_reconnect: config.flush_on_reconnect,
        };
        let pool = Pool::new(&config.servers, &settings)?;
        Ok(Client {
            pool,
            serializer: config.serializer,
            cache_cas: config.cache_cas,
            min_compress_len: config.min_compress_len,
            cas_ids: HashMap::new(),
        })
    }

    /// Retrieve a key. Returns `None` on a miss or when the key's servers
    /// are unreachable.
    pub async fn get<K: IntoKey>(&mut self, key: K) -> Result<Option<Value<S::Object>>, Error> {
        self.retrieve(b"get", key.into_key()).await
    }

    /// Like [`Client::get`], but also records the entry's CAS token for a
    /// later [`Client::cas`] when the client was built with `cache_cas`.
    pub async fn gets<K: IntoKey>(&mut self, key: K) -> Result<Option<Value<S::Object>>, Error> {
        self.retrieve(b"gets", key.into_key()).await
    }

    /// Unconditionally store a value.
    pub async fn set<K, V>(&mut self, key: K, value: V, options: StoreOptions) -> Result<bool, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        self.store(StoreVerb::Set, key.into_key(), value.into(), options).await
    }

    /// Store only if the key does not exist yet.
    pub async fn add<K, V>(&mut self, key: K, value: V, options: StoreOptions) -> Result<bool, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        self.store(StoreVerb::Add, key.into_key(), value.into(), options).await
    }

    /// Store only if the key already exists.
    pub async fn replace<K, V>(
        &mut self,
        key: K,
        value: V,
        options: StoreOptions,
    ) -> Result<bool, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        self.store(StoreVerb::Replace, key.into_key(), value.into(), options).await
    }

    /// Append raw bytes to an existing value.
    pub async fn append<K, V>(
        &mut self,
        key: K,
        value: V,
        options: StoreOptions,
    ) -> Result<bool, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        self.store(StoreVerb::Append, key.into_key(), value.into(), options).await
    }

    /// Prepend raw bytes to an existing value.
    pub async fn prepend<K, V>(
        &mut self,
        key: K,
        value: V,
        options: StoreOptions,
    ) -> Result<bool, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        self.store(StoreVerb::Prepend, key.into_key(), value.into(), options).await
    }

    /// Store only if the entry is unchanged since the last `gets`. Without
    /// a recorded token for the key this degrades to a plain `set`.
    pub async fn cas<K, V>(&mut self, key: K, value: V, options: StoreOptions) -> Result<bool, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        self.store(StoreVerb::Cas, key.into_key(), value.into(), options).await
    }

    /// Atomically add `delta` to a decimal value. Returns the new value, or
    /// `None` when the key is missing (or on `noreply`).
    pub async fn incr<K: IntoKey>(
        &mut self,
        key: K,
        delta: u64,
        noreply: bool,
    ) -> Result<Option<u64>, Error> {
        self.arith(b"incr", key.into_key(), delta, noreply).await
    }

    /// Like [`Client::incr`], subtracting. The server clamps at zero.
    pub async fn decr<K: IntoKey>(
        &mut self,
        key: K,
        delta: u64,
        noreply: bool,
    ) -> Result<Option<u64>, Error> {
        self.arith(b"decr", key.into_key(), delta, noreply).await
    }

    /// Delete a key. A missing key still counts as success.
    pub async fn delete<K: IntoKey>(&mut self, key: K, noreply: bool) -> Result<bool, Error> {
        self.delete_touch(
            b"delete",
            key.into_key(),
            None,
            noreply,
            &[&b"DELETED"[..], &b"NOT_FOUND"[..]],
        )
        .await
    }

    /// Update a key's expiration without touching its value.
    pub async fn touch<K: IntoKey>(
        &mut self,
        key: K,
        expire: u32,
        noreply: bool,
    ) -> Result<bool, Error> {
        self.delete_touch(b"touch", key.into_key(), Some(expire), noreply, &[&b"TOUCHED"[..]])
            .await
    }

    /// Retrieve many keys with one round trip per server. The result maps
    /// original (unprefixed) keys to their values; misses and keys on
    /// unreachable servers are simply absent.
    pub async fn get_multi<K: IntoKey>(
        &mut self,
        keys: Vec<K>,
        prefix: &[u8],
    ) -> Result<HashMap<Vec<u8>, Value<S::Object>>, Error> {
        let items = keys.into_iter().map(|key| (key, ())).collect();
        let (groups, _dropped) = self.partition(items, prefix).await?;

        let mut live = Vec::new();
        for (index, entries) in groups {
            let mut cmd = b"get".to_vec();
            for entry in &entries {
                cmd.push(b' ');
                cmd.extend_from_slice(&entry.wire_key);
            }
            let conn = self.pool.conn_mut(index);
            if conn.send_one(&cmd).await.is_ok() {
                live.push((index, entries));
            }
        }

        let mut values = HashMap::new();
        for (index, entries) in live {
            let serializer = &self.serializer;
            let conn = self.pool.conn_mut(index);
            // A failure mid-drain already marked the server dead; whatever
            // was collected before it stands.
            let _ = drain_values(conn, serializer, &entries, &mut values).await;
        }
        Ok(values)
    }

    /// Store many entries with one round trip per server. Returns the
    /// original keys that were not stored: rejected by the codec, refused
    /// by the server, or bound to a server that is unreachable or died
    /// mid-exchange.
    pub async fn set_multi<K, V>(
        &mut self,
        entries: Vec<(K, V)>,
        options: StoreOptions,
        prefix: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error>
    where
        K: IntoKey,
        V: Into<Value<S::Object>>,
    {
        let items: Vec<(K, Value<S::Object>)> =
            entries.into_iter().map(|(key, value)| (key, value.into())).collect();
        let (groups, mut failed) = self.partition(items, prefix).await?;

        let min_compress_len = options.min_compress_len.unwrap_or(self.min_compress_len);
        let mut live = Vec::new();
        for (index, entries) in groups {
            let mut buffer = Vec::new();
            let mut on_wire = Vec::new();
            for entry in entries {
                match codec::encode(&entry.payload, &self.serializer, min_compress_len) {
                    Ok((flags, bytes)) => {
                        buffer.extend_from_slice(&build_store_frame(
                            b"set",
                            &entry.wire_key,
                            flags,
                            options.expire,
                            &bytes,
                            None,
                            options.noreply,
                        ));
                        on_wire.push(MultiEntry {
                            wire_key: entry.wire_key,
                            orig_key: entry.orig_key,
                            payload: (),
                        });
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "value rejected by codec");
                        failed.push(entry.orig_key);
                    }
                }
            }
            if on_wire.is_empty() {
                continue;
            }
            let conn = self.pool.conn_mut(index);
            match conn.send(&buffer).await {
                Ok(()) => live.push((index, on_wire)),
                Err(_) => failed.extend(on_wire.into_iter().map(|entry| entry.orig_key)),
            }
        }

        if options.noreply {
            return Ok(failed);
        }

        for (index, entries) in live {
            let conn = self.pool.conn_mut(index);
            for (pos, entry) in entries.iter().enumerate() {
                match conn.readline().await {
                    Ok(line) => {
                        if line != b"STORED" {
                            failed.push(entry.orig_key.clone());
                        }
                    }
                    Err(_) => {
                        // The server died mid-read; the remaining responses
                        // on this socket are lost.
                        failed.extend(entries[pos..].iter().map(|e| e.orig_key.clone()));
                        break;
                    }
                }
            }
        }
        Ok(failed)
    }

    /// Delete many keys with one round trip per server. Returns false when
    /// any server failed mid-exchange; missing keys are not failures.
    pub async fn delete_multi<K: IntoKey>(
        &mut self,
        keys: Vec<K>,
        noreply: bool,
        prefix: &[u8],
    ) -> Result<bool, Error> {
        let items = keys.into_iter().map(|key| (key, ())).collect();
        let (groups, _dropped) = self.partition(items, prefix).await?;

        let mut ok = true;
        let mut live = Vec::new();
        for (index, entries) in groups {
            let mut buffer = Vec::new();
            for entry in &entries {
                buffer.extend_from_slice(b"delete ");
                buffer.extend_from_slice(&entry.wire_key);
                if noreply {
                    buffer.extend_from_slice(b" noreply");
                }
                buffer.extend_from_slice(b"\r\n");
            }
            let conn = self.pool.conn_mut(index);
            match conn.send(&buffer).await {
                Ok(()) => live.push((index, entries)),
                Err(_) => ok = false,
            }
        }

        if noreply {
            return Ok(ok);
        }

        for (index, entries) in live {
            let conn = self.pool.conn_mut(index);
            for _ in &entries {
                match conn.readline().await {
                    Ok(line) => {
                        if line != b"DELETED" && line != b"NOT_FOUND" {
                            tracing::debug!(
                                got = %String::from_utf8_lossy(&line),
                                "unexpected delete response"
                            );
                        }
                    }
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
        }
        Ok(ok)
    }

    /// Expire all data on every reachable server.
    pub async fn flush_all(&mut self) -> Result<(), Error> {
        for conn in self.pool.iter_mut() {
            if !conn.connect().await {
                continue;
            }
            // A flush failure already marked the server dead; move on.
            let _ = conn.flush().await;
        }
        Ok(())
    }

    /// Fetch `stats [args]` from every reachable server, as
    /// `(server name, field map)` pairs in configured order.
    pub async fn stats(
        &mut self,
        args: Option<&str>,
    ) -> Result<Vec<(String, HashMap<String, String>)>, Error> {
        let mut out = Vec::new();
        for conn in self.pool.iter_mut() {
            if !conn.connect().await {
                continue;
            }
            let cmd = match args {
                Some(args) => format!("stats {}", args).into_bytes(),
                None => b"stats".to_vec(),
            };
            if conn.send_one(&cmd).await.is_err() {
                continue;
            }
            let mut fields = HashMap::new();
            loop {
                let line = match conn.readline().await {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if line.is_empty() || line == b"END" {
                    break;
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                let mut parts = text.splitn(3, ' ');
                if let (Some("STAT"), Some(name), Some(value)) =
                    (parts.next(), parts.next(), parts.next())
                {
                    fields.insert(name.to_string(), value.to_string());
                }
            }
            out.push((conn.name(), fields));
        }
        Ok(out)
    }

    /// Drop the recorded CAS tokens. The map is otherwise unbounded.
    pub fn reset_cas(&mut self) {
        self.cas_ids.clear();
    }

    /// Close every socket. Connections redial on next use.
    pub fn disconnect_all(&mut self) {
        for conn in self.pool.iter_mut() {
            conn.close();
        }
    }

    /// Clear every dead-server blacklist.
    pub fn forget_dead_hosts(&mut self) {
        self.pool.forget_dead_hosts();
    }

    /// Number of configured servers.
    pub fn server_count(&self) -> usize {
        self.pool.len()
    }

    pub(crate) async fn keep_alive(&mut self) -> Result<(), Error> {
        for conn in self.pool.iter_mut() {
            if !conn.connect().await {
                continue;
            }
            conn.version().await?;
        }
        Ok(())
    }

    async fn retrieve(
        &mut self,
        verb: &'static [u8],
        key: Key,
    ) -> Result<Option<Value<S::Object>>, Error> {
        check_key(key.bytes(), 0)?;
        let (index, wire_key) = match self.pool.get(key).await {
            Some(found) => found,
            None => return Ok(None),
        };
        let want_cas = verb == &b"gets"[..];
        let cache_cas = self.cache_cas;
        let serializer = &self.serializer;
        let cas_ids = &mut self.cas_ids;
        let conn = self.pool.conn_mut(index);
        match fetch(conn, serializer, verb, &wire_key, want_cas, cache_cas, cas_ids).await {
            Ok(value) => Ok(value),
            Err(Error::ConnectionDead) => {
                conn.revive();
                if conn.connect().await {
                    match fetch(conn, serializer, verb, &wire_key, want_cas, cache_cas, cas_ids)
                        .await
                    {
                        Ok(value) => Ok(value),
                        Err(_) => Ok(None),
                    }
                } else {
                    Ok(None)
                }
            }
            Err(_) => Ok(None),
        }
    }

    async fn store(
        &mut self,
        verb: StoreVerb,
        key: Key,
        value: Value<S::Object>,
        options: StoreOptions,
    ) -> Result<bool, Error> {
        check_key(key.bytes(), 0)?;
        let (index, wire_key) = match self.pool.get(key).await {
            Some(found) => found,
            None => return Ok(false),
        };

        // An unknown CAS token silently degrades to a plain set.
        let verb = if verb == StoreVerb::Cas && !self.cas_ids.contains_key(&wire_key) {
            StoreVerb::Set
        } else {
            verb
        };
        let cas_token = match verb {
            StoreVerb::Cas => self.cas_ids.get(&wire_key).copied(),
            _ => None,
        };

        let min_compress_len = options.min_compress_len.unwrap_or(self.min_compress_len);
        let (flags, bytes) = match codec::encode(&value, &self.serializer, min_compress_len) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::debug!(error = %err, "value rejected by codec");
                return Ok(false);
            }
        };
        let frame = build_store_frame(
            verb.token(),
            &wire_key,
            flags,
            options.expire,
            &bytes,
            cas_token,
            options.noreply,
        );

        let conn = self.pool.conn_mut(index);
        match store_exchange(conn, &frame, options.noreply).await {
            Ok(stored) => Ok(stored),
            Err(Error::ConnectionDead) => {
                conn.revive();
                if conn.connect().await {
                    match store_exchange(conn, &frame, options.noreply).await {
                        Ok(stored) => Ok(stored),
                        Err(_) => Ok(false),
                    }
                } else {
                    Ok(false)
                }
            }
            Err(_) => Ok(false),
        }
    }

    async fn arith(
        &mut self,
        verb: &'static [u8],
        key: Key,
        delta: u64,
        noreply: bool,
    ) -> Result<Option<u64>, Error> {
        check_key(key.bytes(), 0)?;
        let (index, wire_key) = match self.pool.get(key).await {
            Some(found) => found,
            None => return Ok(None),
        };
        let mut cmd = Vec::new();
        cmd.extend_from_slice(verb);
        cmd.push(b' ');
        cmd.extend_from_slice(&wire_key);
        cmd.push(b' ');
        cmd.extend_from_slice(delta.to_string().as_bytes());
        if noreply {
            cmd.extend_from_slice(b" noreply");
        }

        let conn = self.pool.conn_mut(index);
        match arith_exchange(conn, &cmd, noreply).await {
            Ok(result) => Ok(result),
            Err(Error::ConnectionDead) => {
                conn.revive();
                if conn.connect().await {
                    match arith_exchange(conn, &cmd, noreply).await {
                        Ok(result) => Ok(result),
                        Err(_) => Ok(None),
                    }
                } else {
                    Ok(None)
                }
            }
            Err(_) => Ok(None),
        }
    }

    async fn delete_touch(
        &mut self,
        verb: &'static [u8],
        key: Key,
        expire: Option<u32>,
        noreply: bool,
        expected: &[&[u8]],
    ) -> Result<bool, Error> {
        check_key(key.bytes(), 0)?;
        let (index, wire_key) = match self.pool.get(key).await {
            Some(found) => found,
            None => return Ok(false),
        };
        let mut cmd = Vec::new();
        cmd.extend_from_slice(verb);
        cmd.push(b' ');
        cmd.extend_from_slice(&wire_key);
        if let Some(expire) = expire {
            cmd.push(b' ');
            cmd.extend_from_slice(expire.to_string().as_bytes());
        }
        if noreply {
            cmd.extend_from_slice(b" noreply");
        }

        let conn = self.pool.conn_mut(index);
        match status_exchange(conn, &cmd, noreply, expected).await {
            Ok(matched) => Ok(matched),
            Err(Error::ConnectionDead) => {
                conn.revive();
                if conn.connect().await {
                    match status_exchange(conn, &cmd, noreply, expected).await {
                        Ok(matched) => Ok(matched),
                        Err(_) => Ok(false),
                    }
                } else {
                    Ok(false)
                }
            }
            Err(_) => Ok(false),
        }
    }

    /// Partition keys by server. Groups come back in first-use order, each
    /// holding the wire key (prefix applied), the original key, and the
    /// caller's payload; keys whose every probe failed land in the dropped
    /// list.
    async fn partition<K, P>(
        &mut self,
        items: Vec<(K, P)>,
        prefix: &[u8],
    ) -> Result<(Vec<(usize, Vec<MultiEntry<P>>)>, Vec<Vec<u8>>), Error>
    where
        K: IntoKey,
    {
        if !prefix.is_empty() {
            check_key(prefix, 0)?;
        }
        let mut groups: Vec<(usize, Vec<MultiEntry<P>>)> = Vec::new();
        let mut dropped = Vec::new();
        for (key, payload) in items {
            let key = key.into_key();
            let orig_key = key.bytes().to_vec();
            check_key(&orig_key, prefix.len())?;
            let (hint, bytes) = key.into_parts();
            let mut wire = Vec::with_capacity(prefix.len() + bytes.len());
            wire.extend_from_slice(prefix);
            wire.extend_from_slice(&bytes);
            let key = match hint {
                Some(hint) => Key::with_hint(hint, wire),
                None => Key::new(wire),
            };
            match self.pool.get(key).await {
                Some((index, wire_key)) => {
                    let entry = MultiEntry { wire_key, orig_key, payload };
                    match groups.iter_mut().find(|(existing, _)| *existing == index) {
                        Some((_, entries)) => entries.push(entry),
                        None => groups.push((index, vec![entry])),
                    }
                }
                None => dropped.push(orig_key),
            }
        }
        Ok((groups, dropped))
    }
}

fn build_store_frame(
    verb: &[u8],
    wire_key: &[u8],
    flags: u16,
    expire: u32,
    value: &[u8],
    cas_token: Option<u64>,
    noreply: bool,
) -> Vec<u8> {
    let mut header = format!(" {} {} {}", flags, expire, value.len());
    if let Some(token) = cas_token {
        header.push_str(&format!(" {}", token));
    }
    if noreply {
        header.push_str(" noreply");
    }
    let mut frame =
        Vec::with_capacity(verb.len() + wire_key.len() + header.len() + value.len() + 6);
    frame.extend_from_slice(verb);
    frame.push(b' ');
    frame.extend_from_slice(wire_key);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(b"\r\n");
    frame.extend_from_slice(value);
    frame.extend_from_slice(b"\r\n");
    frame
}

async fn fetch<C: Transport, S: Serializer>(
    conn: &mut Connection<C>,
    serializer: &S,
    verb: &[u8],
    wire_key: &[u8],
    want_cas: bool,
    cache_cas: bool,
    cas_ids: &mut HashMap<Vec<u8>, u64>,
) -> Result<Option<Value<S::Object>>, Error> {
    let mut cmd = Vec::with_capacity(verb.len() + wire_key.len() + 1);
    cmd.extend_from_slice(verb);
    cmd.push(b' ');
    cmd.extend_from_slice(wire_key);
    conn.send_one(&cmd).await?;

    let line = conn.readline().await?;
    let header = if want_cas {
        parse_cas_value_header(&line)
    } else {
        parse_value_header(&line)
    };
    let header = match header {
        Ok(Some(header)) => header,
        Ok(None) => {
            // Misses answer with a bare END, consumed here. Server error
            // lines land here too and read as a miss.
            if line != b"END" {
                tracing::debug!(
                    got = %String::from_utf8_lossy(&line),
                    "unexpected get response"
                );
            }
            return Ok(None);
        }
        Err(err) => {
            conn.mark_dead("malformed VALUE header");
            return Err(Error::Protocol(err));
        }
    };

    let body = conn.read_value_body(header.len).await?;
    conn.expect(b"END").await?;

    if want_cas && cache_cas {
        if let Some(cas) = header.cas {
            cas_ids.insert(header.key.clone(), cas);
        }
    }

    match codec::decode(header.flags, body, serializer) {
        Ok(value) => Ok(Some(value)),
        Err(CodecError::UnknownFlags(flags)) => {
            conn.mark_dead("unknown value flags");
            Err(Error::Codec(CodecError::UnknownFlags(flags)))
        }
        Err(err) => {
            tracing::debug!(error = %err, "undecodable value");
            Ok(None)
        }
    }
}

async fn store_exchange<C: Transport>(
    conn: &mut Connection<C>,
    frame: &[u8],
    noreply: bool,
) -> Result<bool, Error> {
    conn.send(frame).await?;
    if noreply {
        return Ok(true);
    }
    let line = conn.expect(b"STORED").await?;
    Ok(line == b"STORED")
}

async fn arith_exchange<C: Transport>(
    conn: &mut Connection<C>,
    cmd: &[u8],
    noreply: bool,
) -> Result<Option<u64>, Error> {
    conn.send_one(cmd).await?;
    if noreply {
        return Ok(None);
    }
    let line = conn.readline().await?;
    if line == b"NOT_FOUND" {
        return Ok(None);
    }
    match std::str::from_utf8(&line).ok().and_then(|text| text.parse::<u64>().ok()) {
        Some(n) => Ok(Some(n)),
        None => {
            tracing::debug!(
                got = %String::from_utf8_lossy(&line),
                "unexpected incr/decr response"
            );
            Ok(None)
        }
    }
}

async fn status_exchange<C: Transport>(
    conn: &mut Connection<C>,
    cmd: &[u8],
    noreply: bool,
    expected: &[&[u8]],
) -> Result<bool, Error> {
    conn.send_one(cmd).await?;
    if noreply {
        return Ok(true);
    }
    let line = conn.readline().await?;
    if expected.iter().any(|token| line == *token) {
        Ok(true)
    } else {
        tracing::debug!(
            got = %String::from_utf8_lossy(&line),
            "unexpected response status"
        );
        Ok(false)
    }
}

async fn drain_values<C: Transport, S: Serializer>(
    conn: &mut Connection<C>,
    serializer: &S,
    entries: &[MultiEntry<()>],
    values: &mut HashMap<Vec<u8>, Value<S::Object>>,
) -> Result<(), Error> {
    loop {
        let line = conn.readline().await?;
        if line == b"END" {
            return Ok(());
        }
        let header = match parse_value_header(&line) {
            Ok(Some(header)) => header,
            Ok(None) => {
                tracing::debug!(
                    got = %String::from_utf8_lossy(&line),
                    "unexpected line in get response"
                );
                continue;
            }
            Err(err) => {
                conn.mark_dead("malformed VALUE header");
                return Err(Error::Protocol(err));
            }
        };
        let body = conn.read_value_body(header.len).await?;
        let entry = match entries.iter().find(|entry| entry.wire_key == header.key) {
            Some(entry) => entry,
            None => continue,
        };
        match codec::decode(header.flags, body, serializer) {
            Ok(value) => {
                values.insert(entry.orig_key.clone(), value);
            }
            Err(CodecError::UnknownFlags(flags)) => {
                conn.mark_dead("unknown value flags");
                return Err(Error::Codec(CodecError::UnknownFlags(flags)));
            }
            Err(err) => {
                tracing::debug!(error = %err, "undecodable value in get response");
            }
        }
    }
}

/// Factory for pooled clients. Creation and recycling health-check every
/// reachable server with the `version` command.
pub struct ClientManager<C: Transport, S: Serializer> {
    config: ClientConfig<S>,
    _transport: PhantomData<fn() -> C>,
}

impl<C: Transport, S: Serializer> ClientManager<C, S> {
    pub fn new(config: ClientConfig<S>) -> Self {
        ClientManager { config, _transport: PhantomData }
    }
}

#[async_trait]
impl<C, S> Manager for ClientManager<C, S>
where
    C: Transport,
    S: Serializer + 'static,
{
    type Type = Client<C, S>;
    type Error = Error;

    async fn create(&self) -> Result<Client<C, S>, Error> {
        let mut client = Client::new(self.config.clone())?;
        client.keep_alive().await?;
        Ok(client)
    }

    async fn recycle(&self, client: &mut Client<C, S>) -> RecycleResult<Error> {
        client.keep_alive().await.map_err(RecycleError::Backend)
    }
}

/// A pool of ready clients. Checking one out is cheap compared to redialing
/// every server, and the pool bounds the total connection count.
pub type ClientPool<C, S> = deadpool::managed::Pool<ClientManager<C, S>>;
