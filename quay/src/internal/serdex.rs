//! Helpers for walking dynamically-shaped YAML documents while producing
//! positional format errors.

use serde_yaml::{Mapping, Value};

use crate::core::errors::ManifestFormatError;

pub fn expect_mapping<'a>(
    value: &'a Value,
    file: &str,
    field: &str,
) -> Result<&'a Mapping, ManifestFormatError> {
    value
        .as_mapping()
        .ok_or_else(|| ManifestFormatError::new(file, field, "expected a map"))
}

pub fn expect_str<'a>(
    value: &'a Value,
    file: &str,
    field: &str,
) -> Result<&'a str, ManifestFormatError> {
    value
        .as_str()
        .ok_or_else(|| ManifestFormatError::new(file, field, "expected a string"))
}

pub fn expect_bool(value: &Value, file: &str, field: &str) -> Result<bool, ManifestFormatError> {
    value
        .as_bool()
        .ok_or_else(|| ManifestFormatError::new(file, field, "expected a boolean"))
}

pub fn get<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(Value::String(key.into()))
}

pub fn get_str<'a>(
    mapping: &'a Mapping,
    key: &str,
    file: &str,
    field: &str,
) -> Result<Option<&'a str>, ManifestFormatError> {
    match get(mapping, key) {
        None => Ok(None),
        Some(value) => Ok(Some(expect_str(
            value,
            file,
            &format!("{field}.{key}"),
        )?)),
    }
}

pub fn require_str<'a>(
    mapping: &'a Mapping,
    key: &str,
    file: &str,
    field: &str,
) -> Result<&'a str, ManifestFormatError> {
    get_str(mapping, key, file, field)?.ok_or_else(|| {
        ManifestFormatError::new(file, field, format!("missing required key `{key}`"))
    })
}
