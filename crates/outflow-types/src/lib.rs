//! Shared outflow data model, canonical schema, and error types.
//!
//! Every other workspace crate depends on this one; it carries no I/O.

#![warn(clippy::pedantic)]

pub mod error;
pub mod model;
pub mod schema;
pub mod state;
