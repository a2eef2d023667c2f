//! Phonebook import pipeline
//!
//! Validates raw CSV rows into contact candidates, collapses duplicates within
//! a batch and writes each batch with one transactional bulk upsert. Row-level
//! problems are recorded in the result; only a store fault stops the run.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::cancellation::RunControl;
use super::phone::PhoneRule;
use super::retry::{retry_transient, RetryPolicy};
use super::rows::{CsvRowSource, ResolvedMapping};
use crate::error::{Interrupted, JobError};
use crate::store::ContactStore;
use crate::types::{
    ColumnMapping, ContactCandidate, DuplicatePolicy, ImportResult, InvalidRow, JobProgress,
    PhonebookId, RawRow, ValidationError,
};

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub phone_rule: PhoneRule,
    /// Cap on `invalid_row_details`; `rows_invalid` still counts every row
    pub max_invalid_details: usize,
    pub retry: RetryPolicy,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            phone_rule: PhoneRule::default(),
            max_invalid_details: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ImportPipeline {
    store: Arc<dyn ContactStore>,
    settings: ImportSettings,
}

/// Candidates waiting for the next write, unique by phone
struct PendingBatch {
    candidates: Vec<ContactCandidate>,
    by_phone: HashMap<String, usize>,
    /// Rows collapsed into an earlier candidate of this batch
    collapsed: u64,
}

impl PendingBatch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            candidates: Vec::with_capacity(capacity),
            by_phone: HashMap::with_capacity(capacity),
            collapsed: 0,
        }
    }

    fn len(&self) -> usize {
        self.candidates.len()
    }

    fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Add a candidate. A phone already in the batch is collapsed into the
    /// earlier candidate: merged under overwrite, dropped under skip.
    fn push(&mut self, candidate: ContactCandidate, policy: DuplicatePolicy) {
        match self.by_phone.get(&candidate.phone) {
            Some(&idx) => {
                if let DuplicatePolicy::Overwrite { blank_overwrites } = policy {
                    self.candidates[idx].merge_from(candidate, blank_overwrites);
                }
                self.collapsed += 1;
            }
            None => {
                self.by_phone.insert(candidate.phone.clone(), self.candidates.len());
                self.candidates.push(candidate);
            }
        }
    }

    fn clear(&mut self) {
        self.candidates.clear();
        self.by_phone.clear();
        self.collapsed = 0;
    }
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn ContactStore>, settings: ImportSettings) -> Self {
        Self { store, settings }
    }

    /// Import every row of `source` into `phonebook_id`.
    ///
    /// On a store fault or cancellation the error carries the counts of the
    /// batches committed so far.
    pub async fn run(
        &self,
        phonebook_id: PhonebookId,
        source: CsvRowSource,
        mapping: &ColumnMapping,
        policy: DuplicatePolicy,
        control: &RunControl,
    ) -> Result<ImportResult, Interrupted<ImportResult>> {
        let mut result = ImportResult::default();

        let phonebook = retry_transient(&self.settings.retry, "load phonebook", || {
            self.store.phonebook(phonebook_id)
        })
        .await
        .map_err(|e| interrupt(&result, e.into()))?;
        if phonebook.is_none() {
            return Err(interrupt(&result, JobError::NotFound(format!("phonebook {}", phonebook_id))));
        }

        let columns = ResolvedMapping::resolve(mapping, source.headers()).map_err(|e| interrupt(&result, e))?;
        debug!("Import into phonebook {} with columns {:?}", phonebook_id, columns);

        let batch_size = self.settings.batch_size.max(1);
        let mut batch = PendingBatch::with_capacity(batch_size);
        let mut rows = source.into_rows();

        while let Some(item) = rows.next().await {
            // Rows past the last full batch may all be invalid or collapsed, so
            // the read loop watches for cancellation too
            if result.rows_total % batch_size as u64 == 0 {
                self.check_cancelled(phonebook_id, &result, control)?;
            }
            result.rows_total += 1;

            let row = match item {
                Ok(row) => row,
                Err(unreadable) => {
                    self.record_invalid(
                        &mut result,
                        unreadable.row_number,
                        ValidationError::Unreadable {
                            message: unreadable.message,
                        },
                        None,
                    );
                    continue;
                }
            };

            let candidate = match self.validate(&row, &columns) {
                Ok(candidate) => candidate,
                Err((reason, raw_phone)) => {
                    self.record_invalid(&mut result, row.row_number, reason, raw_phone);
                    continue;
                }
            };

            batch.push(candidate, policy);
            if batch.len() >= batch_size {
                self.flush(phonebook_id, &mut batch, policy, &mut result, control).await?;
            }
        }

        if batch.is_empty() {
            self.check_cancelled(phonebook_id, &result, control)?;
        } else {
            self.flush(phonebook_id, &mut batch, policy, &mut result, control).await?;
        }

        info!(
            "Import into phonebook {} finished: {} rows, {} inserted, {} updated, {} duplicates, {} invalid in {} batches",
            phonebook_id,
            result.rows_total,
            result.rows_inserted,
            result.rows_updated,
            result.rows_skipped_duplicate,
            result.rows_invalid,
            result.batches_committed
        );
        Ok(result)
    }

    /// Turn a raw row into a candidate, or a rejection with the raw phone text
    fn validate(
        &self,
        row: &RawRow,
        columns: &ResolvedMapping,
    ) -> Result<ContactCandidate, (ValidationError, Option<String>)> {
        let raw_phone = row.fields.get(columns.phone).ok_or((
            ValidationError::RowTooShort {
                found: row.fields.len(),
                needed: columns.phone + 1,
            },
            None,
        ))?;

        let phone = self
            .settings
            .phone_rule
            .normalize(raw_phone)
            .map_err(|reason| (reason, Some(raw_phone.clone())))?;

        Ok(ContactCandidate {
            row_number: row.row_number,
            phone,
            first_name: text_field(row, columns.first_name),
            last_name: text_field(row, columns.last_name),
            email: text_field(row, columns.email).map(|email| email.to_lowercase()),
            status: text_field(row, columns.status),
        })
    }

    fn record_invalid(
        &self,
        result: &mut ImportResult,
        row_number: u64,
        reason: ValidationError,
        raw_phone: Option<String>,
    ) {
        result.rows_invalid += 1;
        if result.invalid_row_details.len() < self.settings.max_invalid_details {
            result.invalid_row_details.push(InvalidRow {
                row_number,
                reason,
                raw_phone,
            });
        }
    }

    async fn flush(
        &self,
        phonebook_id: PhonebookId,
        batch: &mut PendingBatch,
        policy: DuplicatePolicy,
        result: &mut ImportResult,
        control: &RunControl,
    ) -> Result<(), Interrupted<ImportResult>> {
        self.check_cancelled(phonebook_id, result, control)?;

        let candidates = &batch.candidates;
        let outcome = retry_transient(&self.settings.retry, "write contact batch", || {
            self.store.write_contact_batch(phonebook_id, candidates, policy)
        })
        .await
        .map_err(|e| {
            warn!(
                "Import into phonebook {} stopped after {} batches: {}",
                phonebook_id, result.batches_committed, e
            );
            interrupt(result, e.into())
        })?;

        result.rows_inserted += outcome.inserted;
        result.rows_updated += outcome.updated;
        result.rows_skipped_duplicate += outcome.skipped;
        match policy {
            DuplicatePolicy::Skip => result.rows_skipped_duplicate += batch.collapsed,
            DuplicatePolicy::Overwrite { .. } => result.rows_updated += batch.collapsed,
        }
        result.batches_committed += 1;
        batch.clear();

        control.report(JobProgress {
            batches_committed: result.batches_committed,
            rows_processed: result.rows_total,
        });
        Ok(())
    }

    fn check_cancelled(
        &self,
        phonebook_id: PhonebookId,
        result: &ImportResult,
        control: &RunControl,
    ) -> Result<(), Interrupted<ImportResult>> {
        if control.is_cancelled() {
            info!(
                "Import into phonebook {} cancelled after {} batches",
                phonebook_id, result.batches_committed
            );
            return Err(interrupt(result, JobError::Cancelled));
        }
        Ok(())
    }
}

fn text_field(row: &RawRow, idx: Option<usize>) -> Option<String> {
    let value = row.fields.get(idx?)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn interrupt(result: &ImportResult, cause: JobError) -> Interrupted<ImportResult> {
    Interrupted {
        partial: ImportResult {
            aborted: true,
            ..result.clone()
        },
        cause,
    }
}
