//! # keel-core
//! Foundation types and traits for the keel multisig wallet.

pub mod amount;
pub mod constants;
pub mod error;
pub mod path;
pub mod script;
pub mod traits;
pub mod types;

pub use bitcoin;
