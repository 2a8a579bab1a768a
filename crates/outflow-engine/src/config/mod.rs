//! Manifest configuration: YAML types, env substitution, validation, and
//! applying definitions to the metadata store.

pub mod apply;
pub mod parser;
pub mod types;
pub mod validator;

pub use apply::{apply_manifest, open_store, resolve_sync, ApplySummary};
pub use parser::{parse_manifest, parse_manifest_str};
pub use types::Manifest;
pub use validator::validate_manifest;
