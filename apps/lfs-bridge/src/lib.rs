//! Git LFS custom transfer agent that stores objects through an external,
//! credential-bearing bridge process.
//!
//! The host speaks line-delimited JSON on stdin/stdout ([`engine`]). Each
//! object operation goes to a [`backend::Backend`], which is either a local
//! directory or the bridge ([`bridge`]), reached only through
//! [`bridge::BridgeClient::call`].

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod status;
pub mod telemetry;
pub mod validate;

pub use error::{ErrorKind, TransferError};
