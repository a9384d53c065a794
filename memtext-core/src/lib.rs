//! This crate provides the runtime-agnostic core of a client for the
//! memcached ASCII text protocol. A concrete async runtime supplies the
//! [`connection::Transport`] implementation (see the `memtext-tokio` crate);
//! everything else lives here: key sharding, dead-server failover, wire
//! framing, value encoding, and pipelined multi-key operations.
//!
//! If compression is undesired, it is possible to disable the `zlib`
//! feature (on by default.)

pub mod client;
pub mod codec;
pub mod connection;
pub mod key;
pub mod pool;

#[cfg(test)]
pub(crate) mod testing;
