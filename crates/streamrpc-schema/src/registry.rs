use std::collections::BTreeMap;
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::Path;

use jsonschema::Validator;
use serde_json::Value;
use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::{Result, SchemaError};
use crate::strict::apply_strict_mode;
use crate::validator::validate_value;

const SCHEMA_SUFFIX: &str = ".schema.json";

/// Method-keyed registry of compiled JSON Schema validators.
pub struct SchemaRegistry {
    validators: BTreeMap<String, Validator>,
    config: RegistryConfig,
}

impl SchemaRegistry {
    /// Create an empty registry with default config.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            validators: BTreeMap::new(),
            config,
        }
    }

    /// Register a schema for `method` from a JSON string.
    pub fn register(&mut self, method: impl Into<String>, schema_json: &str) -> Result<()> {
        let schema: Value = serde_json::from_str(schema_json)?;
        self.register_value(method, &schema)
    }

    /// Register a schema for `method` from a JSON value.
    pub fn register_value(&mut self, method: impl Into<String>, schema: &Value) -> Result<()> {
        let mut schema = schema.clone();
        if self.config.strict_mode {
            apply_strict_mode(&mut schema);
        }
        let compiled = jsonschema::validator_for(&schema)
            .map_err(|err| SchemaError::CompileFailed(err.to_string()))?;
        self.validators.insert(method.into(), compiled);
        Ok(())
    }

    /// Load every `<method>.schema.json` file in a directory.
    pub fn from_directory(path: &Path) -> Result<Self> {
        Self::from_directory_with_config(path, RegistryConfig::default())
    }

    /// Load schemas from a directory with explicit config.
    ///
    /// Symlinked schema files, files that change while being opened, and
    /// files over the configured size are rejected. Files without the
    /// `.schema.json` suffix are ignored.
    pub fn from_directory_with_config(path: &Path, config: RegistryConfig) -> Result<Self> {
        let mut registry = Self::with_config(config);
        let entries = std::fs::read_dir(path)
            .map_err(|err| SchemaError::LoadFailed(format!("{}: {err}", path.display())))?;

        for entry in entries {
            let entry = entry.map_err(|err| SchemaError::LoadFailed(err.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(method) = file_name.strip_suffix(SCHEMA_SUFFIX) else {
                continue;
            };
            let entry_path = entry.path();
            let path_metadata = std::fs::symlink_metadata(&entry_path)
                .map_err(|err| SchemaError::LoadFailed(err.to_string()))?;
            if path_metadata.file_type().is_symlink() {
                return Err(SchemaError::LoadFailed(format!(
                    "refusing to load schema symlink: {file_name}"
                )));
            }
            if !path_metadata.is_file() {
                continue;
            }
            if !is_valid_method_name(method) {
                return Err(SchemaError::LoadFailed(format!(
                    "schema filename is not a method name: {file_name}"
                )));
            }
            if registry.validators.len() >= registry.config.max_schemas {
                return Err(SchemaError::LoadFailed(format!(
                    "schema count exceeds configured max ({})",
                    registry.config.max_schemas
                )));
            }

            let content = registry.read_schema_file(&entry_path, &path_metadata)?;
            debug!(method, path = ?entry_path, "loaded schema");
            registry.register(method, &content)?;
        }

        Ok(registry)
    }

    fn read_schema_file(&self, path: &Path, path_metadata: &Metadata) -> Result<String> {
        let load_err = |err: std::io::Error| {
            SchemaError::LoadFailed(format!("failed reading schema {}: {err}", path.display()))
        };
        let file = File::open(path).map_err(load_err)?;
        let opened_metadata = file.metadata().map_err(load_err)?;

        #[cfg(unix)]
        {
            if !same_file_identity(path_metadata, &opened_metadata) {
                return Err(SchemaError::LoadFailed(format!(
                    "schema file changed during load: {}",
                    path.display()
                )));
            }
        }
        #[cfg(not(unix))]
        let _ = path_metadata;

        let max_bytes = self.config.max_schema_bytes;
        if opened_metadata.len() > max_bytes as u64 {
            return Err(SchemaError::LoadFailed(format!(
                "schema file too large ({} bytes): {}",
                opened_metadata.len(),
                path.display()
            )));
        }

        // The file may grow between the size check and the read.
        let read_limit = u64::try_from(max_bytes.saturating_add(1)).unwrap_or(u64::MAX);
        let mut content = String::new();
        file.take(read_limit)
            .read_to_string(&mut content)
            .map_err(load_err)?;
        if content.len() > max_bytes {
            return Err(SchemaError::LoadFailed(format!(
                "schema file too large while reading: {}",
                path.display()
            )));
        }
        Ok(content)
    }

    /// Load from embedded `(method, schema)` strings.
    pub fn from_embedded(schemas: &[(&str, &str)]) -> Result<Self> {
        let mut registry = Self::new();
        for (method, schema) in schemas {
            registry.register(*method, schema)?;
        }
        Ok(registry)
    }

    /// Validate call params against the method's schema.
    ///
    /// Absent params are validated as `null`.
    pub fn validate(&self, method: &str, params: Option<&Value>) -> Result<()> {
        match self.validators.get(method) {
            Some(validator) => validate_value(method, params.unwrap_or(&Value::Null), validator),
            None if self.config.fail_on_missing_schema => {
                Err(SchemaError::NoSchema(method.to_string()))
            }
            None => Ok(()),
        }
    }

    pub fn has_schema(&self, method: &str) -> bool {
        self.validators.contains_key(method)
    }

    /// Methods that have registered schemas, in sorted order.
    pub fn methods(&self) -> Vec<&str> {
        self.validators.keys().map(String::as_str).collect()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("methods", &self.methods())
            .field("config", &self.config)
            .finish()
    }
}

fn is_valid_method_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(unix)]
fn same_file_identity(path_metadata: &Metadata, opened_metadata: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    path_metadata.dev() == opened_metadata.dev() && path_metadata.ino() == opened_metadata.ino()
}
