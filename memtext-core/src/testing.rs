//! Scripted in-memory transport used by the unit tests. Inbound bytes are
//! queued per endpoint and delivered one chunk per read, so tests can
//! exercise arbitrary TCP fragmentation; outbound bytes are captured for
//! assertions. State is thread-local, which isolates tests from each other
//! under the default one-thread-per-test harness.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{ServerAddr, Transport};

#[derive(Default)]
struct Endpoint {
    chunks: VecDeque<Vec<u8>>,
    refuse: bool,
    fail_writes: bool,
    connect_attempts: usize,
    sent: Vec<u8>,
}

thread_local! {
    static ENDPOINTS: RefCell<HashMap<String, Endpoint>> = RefCell::new(HashMap::new());
}

fn with_endpoint<T>(key: &str, f: impl FnOnce(&mut Endpoint) -> T) -> T {
    ENDPOINTS.with(|endpoints| f(endpoints.borrow_mut().entry(key.to_string()).or_default()))
}

/// Clear all scripted state. Call at the top of every test.
pub fn reset() {
    ENDPOINTS.with(|endpoints| endpoints.borrow_mut().clear());
}

/// Queue inbound bytes for the given endpoint, delivered one chunk per
/// read. An empty chunk is delivered as a zero-byte read (remote close).
pub fn script(addr: &str, chunks: &[&[u8]]) {
    with_endpoint(addr, |endpoint| {
        for chunk in chunks {
            endpoint.chunks.push_back(chunk.to_vec());
        }
    });
}

/// Make connect attempts to the endpoint fail.
pub fn refuse(addr: &str) {
    with_endpoint(addr, |endpoint| endpoint.refuse = true);
}

/// Undo a [`refuse`].
pub fn allow(addr: &str) {
    with_endpoint(addr, |endpoint| endpoint.refuse = false);
}

/// Make writes to the endpoint fail.
pub fn fail_writes(addr: &str) {
    with_endpoint(addr, |endpoint| endpoint.fail_writes = true);
}

/// Everything written to the endpoint so far.
pub fn sent(addr: &str) -> Vec<u8> {
    with_endpoint(addr, |endpoint| endpoint.sent.clone())
}

pub fn connect_attempts(addr: &str) -> usize {
    with_endpoint(addr, |endpoint| endpoint.connect_attempts)
}

pub struct MockTransport {
    key: String,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(addr: &ServerAddr, _timeout: Duration) -> io::Result<Self> {
        let key = addr.to_string();
        let refused = with_endpoint(&key, |endpoint| {
            endpoint.connect_attempts += 1;
            endpoint.refuse
        });
        if refused {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"));
        }
        Ok(MockTransport { key })
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_endpoint(&self.key, |endpoint| match endpoint.chunks.pop_front() {
            None => Ok(0),
            Some(chunk) if chunk.is_empty() => Ok(0),
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    endpoint.chunks.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
        })
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        with_endpoint(&self.key, |endpoint| {
            if endpoint.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"));
            }
            endpoint.sent.extend_from_slice(data);
            Ok(())
        })
    }
}
