//! Phonebook import types: column mapping, raw rows, validation and results

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A column selected by header name or by zero-based position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Position(usize),
    Name(String),
}

impl From<&str> for ColumnRef {
    fn from(name: &str) -> Self {
        ColumnRef::Name(name.to_string())
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRef::Position(idx) => write!(f, "#{}", idx),
            ColumnRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Binds input columns to contact fields. Only `phone` is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub phone: ColumnRef,
    #[serde(default)]
    pub first_name: Option<ColumnRef>,
    #[serde(default)]
    pub last_name: Option<ColumnRef>,
    #[serde(default)]
    pub email: Option<ColumnRef>,
    #[serde(default)]
    pub status: Option<ColumnRef>,
}

impl ColumnMapping {
    /// Mapping that only reads the phone column
    pub fn phone_only(phone: impl Into<ColumnRef>) -> Self {
        Self {
            phone: phone.into(),
            first_name: None,
            last_name: None,
            email: None,
            status: None,
        }
    }
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            phone: ColumnRef::Name("phone".to_string()),
            first_name: Some(ColumnRef::Name("first_name".to_string())),
            last_name: Some(ColumnRef::Name("last_name".to_string())),
            email: Some(ColumnRef::Name("email".to_string())),
            status: Some(ColumnRef::Name("status".to_string())),
        }
    }
}

/// What to do when a row's phone already exists in the phonebook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Skip,
    /// Replace first/last name, email and status of the existing contact.
    /// With `blank_overwrites` off, blank incoming fields keep stored values.
    #[serde(rename_all = "camelCase")]
    Overwrite {
        #[serde(default)]
        blank_overwrites: bool,
    },
}

/// One raw record from the input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// Line in the source file (header is line 1)
    pub row_number: u64,
    pub fields: Vec<String>,
}

/// A record the reader could not decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableRow {
    pub row_number: u64,
    pub message: String,
}

pub type RowItem = Result<RawRow, UnreadableRow>;

/// Row-level rejection reason
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("phone number is missing")]
    MissingPhone,
    #[error("phone number contains no digits")]
    InvalidPhone,
    #[error("phone number has {digits} digits, at least {min} required")]
    PhoneTooShort { digits: usize, min: usize },
    #[error("phone number has {digits} digits, at most {max} allowed")]
    PhoneTooLong { digits: usize, max: usize },
    #[error("row has {found} fields but the phone column is field {needed}")]
    RowTooShort { found: usize, needed: usize },
    #[error("unreadable row: {message}")]
    Unreadable { message: String },
}

/// Rejected row as reported in the import result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRow {
    pub row_number: u64,
    pub reason: ValidationError,
    pub raw_phone: Option<String>,
}

/// Outcome of an import run (complete or partial)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub rows_total: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped_duplicate: u64,
    pub rows_invalid: u64,
    pub invalid_row_details: Vec<InvalidRow>,
    pub batches_committed: u32,
    pub aborted: bool,
}
