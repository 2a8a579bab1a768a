//! Warehouse clients for outflow.
//!
//! Every dialect implements [`WarehouseClient`] for discovery and reads.
//! Destinations add [`StagingClient`] (BigQuery via GCS, Redshift via S3) or
//! [`DirectWriter`] (webhooks). A [`Registry`] maps connection types to
//! client factories.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bigquery;
pub mod client;
pub mod http;
pub mod ident;
pub mod mongo;
pub mod query;
pub mod redshift;
pub mod registry;
pub mod secret;
pub mod snowflake;
pub mod synapse;
pub mod webhook;

pub use client::{
    unsupported, BatchEnvelope, BufferedRows, DirectWriter, LoadMode, QueryResult, RowIterator,
    StagingClient, StagingOptions, WarehouseClient,
};
pub use query::{parse_cursor_literal, CursorFilter, SelectQuery};
pub use registry::{parse_config, ClientFactory, Registry};
pub use secret::SensitiveString;
