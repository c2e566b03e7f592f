//! Optional JSON Schema validation of call parameters.
//!
//! Schemas are keyed by method name. A server can run every incoming request
//! through a [`SchemaRegistry`] so contract violations surface as invalid
//! params before a handler ever sees them.

pub mod config;
pub mod error;
pub mod registry;
mod strict;
mod validator;

pub use config::{RegistryConfig, DEFAULT_MAX_SCHEMAS, DEFAULT_MAX_SCHEMA_BYTES};
pub use error::{Result, SchemaError};
pub use registry::SchemaRegistry;
