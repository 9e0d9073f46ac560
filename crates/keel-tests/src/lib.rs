//! End-to-end test suite for keel.
//!
//! Wallets run against the in-memory service from `keel-client`, which
//! simulates the chain, the cosigner and the wallet API in one process.

pub mod helpers;
