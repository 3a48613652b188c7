//! The write-consistency and persistence core of a Redis-compatible server.
//!
//! - [`keyspace`]: numbered databases with lazy and active expiration and
//!   memory-ceiling eviction
//! - [`sequencer`]: the one write path, which orders every mutation across
//!   memory, the durable log and the replication stream
//! - [`aof`]: the append-only durable log with online rewrite and replay
//! - [`replication`]: the backlog ring and partial-resync decision
//! - [`rdb`]: the RDB snapshot codec, including legacy compact encodings
//! - [`engine`]: all of the above composed behind one handle
//!
//! Command handlers and network transport live outside this crate and talk
//! to it through [`engine::Engine`].

pub mod aof;
pub mod config;
pub mod engine;
pub mod key_value_store;
pub mod keyspace;
pub mod rdb;
pub mod replication;
pub mod resp;
pub mod sequencer;
pub mod time;
