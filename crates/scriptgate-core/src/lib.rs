//! Scriptgate Core Library
//!
//! Shared functionality for Scriptgate components:
//! - Server configuration resolution and validation
//! - `SQLite` connection setup and the storage error type
//! - Log subscriber setup
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::ServerConfig;
pub use error::{Error, Result};
