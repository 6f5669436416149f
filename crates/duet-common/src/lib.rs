//! Shared utilities for Duet: error types, logging, sample-clock helpers.
//!
//! This crate provides common infrastructure used across all Duet components.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;

pub use error::{Error, Result};
pub use helpers::{duration_to_samples, env_bool, frame_samples};

/// Initialize tracing to stderr.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` applies.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
