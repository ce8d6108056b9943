//! Common utilities and types shared across the call subsystem crates.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for opaque identifier types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for tracing subscriber setup
pub mod logging;
