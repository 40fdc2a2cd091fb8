//! blockmesh Common - Shared types and utilities
//!
//! This crate provides the configuration model, the shared error type and
//! the small parsing helpers (block/volume names, host lists, human sizes)
//! used by the orchestration engine and the command-line front end.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
