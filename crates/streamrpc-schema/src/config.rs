/// Schemas loaded from one directory, at most.
pub const DEFAULT_MAX_SCHEMAS: usize = 256;

/// Largest schema file read from a directory: 256 KiB.
pub const DEFAULT_MAX_SCHEMA_BYTES: usize = 256 * 1024;

/// How a [`SchemaRegistry`](crate::SchemaRegistry) loads schemas and treats
/// methods it has none for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Close every object schema: params may only carry declared properties.
    pub strict_mode: bool,
    /// Reject calls to methods with no registered schema instead of letting
    /// them through.
    pub fail_on_missing_schema: bool,
    pub max_schemas: usize,
    pub max_schema_bytes: usize,
}

impl RegistryConfig {
    /// Closed schemas, unknown methods allowed. The CLI's `--validate` uses
    /// this.
    pub fn strict() -> Self {
        Self {
            strict_mode: true,
            ..Self::default()
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            fail_on_missing_schema: false,
            max_schemas: DEFAULT_MAX_SCHEMAS,
            max_schema_bytes: DEFAULT_MAX_SCHEMA_BYTES,
        }
    }
}
