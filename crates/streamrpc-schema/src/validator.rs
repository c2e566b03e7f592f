use jsonschema::Validator;
use serde_json::Value;

use crate::error::{Result, SchemaError};

/// Errors reported in one message beyond the first.
const EXTRA_ERRORS: usize = 3;

pub(crate) fn validate_value(method: &str, params: &Value, validator: &Validator) -> Result<()> {
    let mut errors = validator.iter_errors(params).map(|err| err.to_string());
    let Some(first) = errors.next() else {
        return Ok(());
    };
    let message = std::iter::once(first)
        .chain(errors.take(EXTRA_ERRORS))
        .collect::<Vec<_>>()
        .join("; ");
    Err(SchemaError::ValidationFailed {
        method: method.to_string(),
        message,
    })
}
