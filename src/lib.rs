//! treesync library
//!
//! Replicates a directory tree with its permissions, either locally with a
//! bounded worker pool or to a remote server over a small TCP protocol.

pub mod cli;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod fingerprint;
pub mod logger;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod replicate;
pub mod tree;
pub mod url;

pub use error::{Result, SyncError};
