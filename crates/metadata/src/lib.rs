//! psych-metadata: validated configuration for the psych feed handler.
//!
//! The document is YAML on disk; scalar knobs are string-typed upstream and
//! parsed here, once, at load. Everything handed out of this crate is
//! immutable for the life of the process.

pub mod config;
pub mod error;
pub mod resource;
pub mod session;

pub use config::{Config, HttpEncoding, Knobs};
pub use error::ConfigError;
pub use resource::{ItemMapping, Resource};
pub use session::SessionConfig;
