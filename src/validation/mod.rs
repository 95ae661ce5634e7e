//! Payload Validation Module
//!
//! Schema checks applied to workflow input before execution starts and to
//! the final aggregated output before it is returned.

pub mod schema;

pub use schema::{Schema, SchemaType, Violation};
