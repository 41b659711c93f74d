//! Advisory JSON schema validation of bus payloads.
//!
//! Validation never aborts processing: an invalid payload is logged and the
//! pipeline moves on to decoding. The schema document is compiled once at
//! startup.

use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

/// Compiled payload schema.
pub struct SchemaValidator {
    compiled: JSONSchema,
}

impl SchemaValidator {
    /// Compile the schema document at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
        let schema: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Schema file is not valid JSON: {}", path.display()))?;

        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&schema)
            .map_err(|e| anyhow!("Failed to compile schema {}: {}", path.display(), e))?;

        Ok(Self { compiled })
    }

    /// Validate a payload against the schema.
    ///
    /// Returns `Ok(true)` when the payload conforms, `Ok(false)` when it does
    /// not (each violation is logged), and an error only when the payload is
    /// not JSON at all.
    pub fn validate(&self, payload: &str) -> Result<bool> {
        let instance: Value =
            serde_json::from_str(payload).context("payload is not valid JSON")?;

        if let Err(errors) = self.compiled.validate(&instance) {
            for error in errors {
                warn!(path = %error.instance_path, "payload invalid: {}", error);
            }
            return Ok(false);
        }

        Ok(true)
    }
}
