//! # keel-client — service clients for the keel wallet.
//!
//! - [`config`] — `ClientConfig`, loaded from file and `KEEL_*` environment
//! - [`http`] — signed JSON-over-HTTP client implementing every service trait
//! - [`memory`] — in-process service with a simulated chain and cosigner
//! - [`error`] — `ClientError`

pub mod config;
pub mod error;
pub mod http;
pub mod memory;

pub use config::ClientConfig;
pub use error::ClientError;
pub use http::HttpClient;
pub use memory::MemoryService;
