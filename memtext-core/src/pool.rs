//! Server selection: the weight-replicated bucket array and the bounded
//! rehash probe that detours around dead servers.

use crate::client::Error;
use crate::connection::{Connection, ConnectionSettings, ServerSpec, Transport};
use crate::key::Key;

/// Probe attempts before giving up on a key.
const CONNECTION_RETRIES: usize = 10;

/// The hash used by the legacy C memcached client: the middle bits of an
/// IEEE CRC32, with 0 substituted by 1. The substitution is load-bearing
/// for parity with that client; changing any of this remaps every key.
pub fn cmemcache_hash(key: &[u8]) -> u32 {
    let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
    if hash == 0 {
        1
    } else {
        hash
    }
}

/// The ordered set of connections and their bucket array. Each connection
/// occupies `weight` consecutive buckets; a key's hash modulo the bucket
/// count picks the primary. This is weighted modulo, not consistent
/// hashing; adding or removing a server remaps most keys.
pub struct Pool<C> {
    connections: Vec<Connection<C>>,
    buckets: Vec<usize>,
}

impl<C: Transport> Pool<C> {
    pub(crate) fn new(specs: &[ServerSpec], settings: &ConnectionSettings) -> Result<Self, Error> {
        let mut connections = Vec::with_capacity(specs.len());
        let mut buckets = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            let conn = Connection::new(spec, settings)?;
            for _ in 0..conn.weight() {
                buckets.push(index);
            }
            connections.push(conn);
        }
        Ok(Pool { connections, buckets })
    }

    /// Resolve a key to a live connection, probing past dead servers.
    ///
    /// Each failed probe rehashes the previous hash concatenated with the
    /// attempt index, so independent clients converge on the same fallback
    /// server without coordinating. Returns the connection index and the
    /// wire key, or `None` when every probe lands on a dead server.
    pub async fn get(&mut self, key: Key) -> Option<(usize, Vec<u8>)> {
        if self.buckets.is_empty() {
            return None;
        }
        let (hint, wire_key) = key.into_parts();
        let mut hash = match hint {
            Some(hint) => hint,
            None => cmemcache_hash(&wire_key),
        };
        for attempt in 0..CONNECTION_RETRIES {
            let index = self.buckets[hash as usize % self.buckets.len()];
            if self.connections[index].connect().await {
                return Some((index, wire_key));
            }
            hash = cmemcache_hash(format!("{}{}", hash, attempt).as_bytes());
        }
        None
    }

    pub(crate) fn conn_mut(&mut self, index: usize) -> &mut Connection<C> {
        &mut self.connections[index]
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<C>> {
        self.connections.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Clear every blacklist so the next probe dials dead servers again.
    pub fn forget_dead_hosts(&mut self) {
        for conn in &mut self.connections {
            conn.revive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DEAD_RETRY, SOCKET_TIMEOUT};
    use crate::testing::{self, MockTransport};
    use tokio_test::block_on;

    fn test_pool(specs: &[ServerSpec]) -> Pool<MockTransport> {
        let settings = ConnectionSettings {
            dead_retry: DEAD_RETRY,
            socket_timeout: SOCKET_TIMEOUT,
            flush_on_reconnect: false,
        };
        Pool::new(specs, &settings).unwrap()
    }

    #[test]
    fn test_cmemcache_hash_vectors() {
        // Precomputed against the reference CRC32-based implementation.
        assert_eq!(26807, cmemcache_hash(b"a"));
        assert_eq!(11356, cmemcache_hash(b"key1"));
        assert_eq!(13653, cmemcache_hash(b"key2"));
        assert_eq!(3187, cmemcache_hash(b"foo"));
        assert_eq!(3402, cmemcache_hash(b"hello world"));
    }

    #[test]
    fn test_hash_zero_becomes_one() {
        // CRC32 of the empty string is 0; the hash substitutes 1.
        assert_eq!(1, cmemcache_hash(b""));
    }

    #[test]
    fn test_buckets_respect_weights() {
        let specs = vec![ServerSpec::from(("a", 2)), ServerSpec::from(("b", 1))];
        let pool = test_pool(&specs);
        assert_eq!(vec![0, 0, 1], pool.buckets);
    }

    #[test]
    fn test_empty_pool_returns_none() {
        testing::reset();
        block_on(async {
            let mut pool = test_pool(&[]);
            assert_eq!(None, pool.get(Key::new(b"anything".to_vec())).await);
        });
    }

    #[test]
    fn test_selection_is_deterministic() {
        testing::reset();
        block_on(async {
            let specs = vec![ServerSpec::from("one"), ServerSpec::from("two")];
            let mut pool = test_pool(&specs);
            // 11356 % 2 == 0, 13653 % 2 == 1.
            let (index, wire_key) = pool.get(Key::new(b"key1".to_vec())).await.unwrap();
            assert_eq!(0, index);
            assert_eq!(b"key1".to_vec(), wire_key);
            let (index, _) = pool.get(Key::new(b"key2".to_vec())).await.unwrap();
            assert_eq!(1, index);
        });
    }

    #[test]
    fn test_hint_bypasses_hashing() {
        testing::reset();
        block_on(async {
            let specs = vec![ServerSpec::from("one"), ServerSpec::from("two")];
            let mut pool = test_pool(&specs);
            let (index, wire_key) = pool.get(Key::with_hint(5, b"key1".to_vec())).await.unwrap();
            // 5 % 2 == 1, even though key1 hashes to bucket 0.
            assert_eq!(1, index);
            assert_eq!(b"key1".to_vec(), wire_key);
        });
    }

    #[test]
    fn test_dead_server_fails_over() {
        testing::reset();
        testing::refuse("inet:two:11211");
        block_on(async {
            let specs = vec![ServerSpec::from("one"), ServerSpec::from("two")];
            let mut pool = test_pool(&specs);
            // "foo" hashes to 3187 -> bucket 1, which is dead; the first
            // rehash (3187 ++ "0" -> 29842) lands on bucket 0.
            let (index, _) = pool.get(Key::new(b"foo".to_vec())).await.unwrap();
            assert_eq!(0, index);
        });
    }

    #[test]
    fn test_all_dead_probe_terminates() {
        testing::reset();
        testing::refuse("inet:one:11211");
        testing::refuse("inet:two:11211");
        block_on(async {
            let specs = vec![ServerSpec::from("one"), ServerSpec::from("two")];
            let mut pool = test_pool(&specs);
            assert_eq!(None, pool.get(Key::new(b"foo".to_vec())).await);
            // Each server was dialed once and then blacklisted; the
            // remaining probes short-circuited.
            assert_eq!(1, testing::connect_attempts("inet:one:11211"));
            assert_eq!(1, testing::connect_attempts("inet:two:11211"));
        });
    }

    #[test]
    fn test_forget_dead_hosts() {
        testing::reset();
        testing::refuse("inet:one:11211");
        block_on(async {
            let specs = vec![ServerSpec::from("one")];
            let mut pool = test_pool(&specs);
            assert_eq!(None, pool.get(Key::new(b"foo".to_vec())).await);

            // Revived and reachable again.
            pool.forget_dead_hosts();
            testing::allow("inet:one:11211");
            assert!(pool.get(Key::new(b"foo".to_vec())).await.is_some());
        });
    }
}
