//! Parse and validate the `kiln.toml` project manifest.

pub mod manifest;

pub use manifest::{Manifest, ManifestError};
