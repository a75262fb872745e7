//! Keel - log-structured workflow engine core
//!
//! A single-writer, multi-reader log dispatcher, the deterministic record
//! stream processor built on top of it, and the cluster messaging transport
//! that carries inter-node protocol traffic.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod export;
pub mod node;
pub mod protocol;
pub mod state;
pub mod stream;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
