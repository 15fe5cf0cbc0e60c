//! Shared helpers.
//!
//! Process bootstrap and retry of transient failures.

pub mod bootstrap;
pub mod retry;
