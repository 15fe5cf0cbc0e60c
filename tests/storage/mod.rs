//! Shared storage integration tests.
//!
//! Tests the StateStore interface against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod state_store_tests;
