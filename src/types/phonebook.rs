//! Phonebook and contact types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PhonebookId = i64;
pub type ContactId = i64;

/// Named, owned collection of contacts
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Phonebook {
    pub id: PhonebookId,
    pub name: String,
    pub description: String,
    pub account_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Request to create a phonebook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePhonebookRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub account_id: i64,
}

/// Stored contact. `phone` is always the normalized digit string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub phonebook_id: PhonebookId,
    pub phone: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A validated import row, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactCandidate {
    /// Line in the source file (header is line 1)
    pub row_number: u64,
    pub phone: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub status: Option<String>,
}

impl ContactCandidate {
    /// Fold a later duplicate row into this one. Present fields of `later` win;
    /// absent ones keep the current value unless `blank_overwrites` is set.
    pub fn merge_from(&mut self, later: ContactCandidate, blank_overwrites: bool) {
        fn pick(current: &mut Option<String>, incoming: Option<String>, blank_overwrites: bool) {
            if incoming.is_some() || blank_overwrites {
                *current = incoming;
            }
        }
        pick(&mut self.first_name, later.first_name, blank_overwrites);
        pick(&mut self.last_name, later.last_name, blank_overwrites);
        pick(&mut self.email, later.email, blank_overwrites);
        pick(&mut self.status, later.status, blank_overwrites);
        self.row_number = later.row_number;
    }
}

/// Reference to a contact as seen by the collector
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ContactRef {
    pub contact_id: ContactId,
    pub phonebook_id: PhonebookId,
    pub phone: String,
}

/// Per-batch outcome of a contact upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriteOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}
