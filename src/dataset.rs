//! Instruction dataset used for warmup and load testing
//!
//! The file is a JSON array of `{ "instruction", "input"?, "output"? }`
//! records. Records without a string `instruction` are skipped.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// One evaluation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// User message sent to the model
    pub instruction: String,
    /// Optional extra context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Reference answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Parse dataset JSON, skipping malformed records
///
/// # Errors
///
/// Returns `FormatError` if the document is not a JSON array
pub fn parse_records(json: &str) -> Result<Vec<DatasetRecord>> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(json).map_err(|e| GatewayError::FormatError {
            reason: format!("Dataset must be a JSON array of records: {e}"),
        })?;

    let total = values.len();
    let records: Vec<DatasetRecord> = values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect();

    if records.len() < total {
        tracing::debug!(
            skipped = total - records.len(),
            "Skipped malformed dataset records"
        );
    }
    Ok(records)
}

/// Read and parse a dataset file
///
/// # Errors
///
/// `IoError` if the file cannot be read, `FormatError` if it is not an array
pub fn load_records(path: &Path) -> Result<Vec<DatasetRecord>> {
    let json = fs::read_to_string(path).map_err(|e| GatewayError::IoError {
        message: format!("Failed to read dataset {}: {e}", path.display()),
    })?;
    parse_records(&json)
}

/// Instruction of every record, in file order
#[must_use]
pub fn instructions(records: &[DatasetRecord]) -> Vec<String> {
    records.iter().map(|r| r.instruction.clone()).collect()
}
