//! Shared helpers.
//!
//! Process bootstrap and the backoff policies used across the crate.

pub mod bootstrap;
pub mod retry;
