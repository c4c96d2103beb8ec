//! Core types for the oxidized-cell atomic primitives
//!
//! This crate provides the foundational error types, configuration,
//! and logging infrastructure shared by the workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{AtomicConfig, Config, DebugConfig, HtmMode, LogLevel, StressConfig};
pub use error::{AtomicError, ConfigError, CoreError, Result};
