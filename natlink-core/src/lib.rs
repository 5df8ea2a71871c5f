//! Natlink core utilities: shared types, configuration, and error handling.
//!
//! This crate carries the pieces every other natlink crate needs:
//! - [`SocketHandle`] and [`TransactionId`] newtypes
//! - [`AgentConfig`] with file/env loading and validation
//! - the common [`Error`]/[`Result`] pair

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod types;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use types::{SocketHandle, TransactionId};
