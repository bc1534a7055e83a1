//! Zero Common - Shared types and utilities for the Zero screener services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup and structured logging helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod config_loader;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{Config, ObservabilityConfig};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}
