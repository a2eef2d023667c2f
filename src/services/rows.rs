//! Streaming CSV row source for phonebook imports
//!
//! The file is parsed on a blocking thread and handed over row by row through
//! a bounded channel, so memory use does not depend on file size.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::JobError;
use crate::types::{ColumnMapping, ColumnRef, RawRow, RowItem, UnreadableRow};

const ROW_CHANNEL_CAPACITY: usize = 1024;

/// Header plus lazy row stream of one CSV file
pub struct CsvRowSource {
    headers: Vec<String>,
    rows: BoxStream<'static, RowItem>,
}

impl CsvRowSource {
    /// Open `file_reference` relative to `upload_dir`
    pub async fn open(upload_dir: &Path, file_reference: &str) -> Result<Self, JobError> {
        let path = resolve_file_reference(upload_dir, file_reference)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| JobError::InvalidInput(format!("cannot open '{}': {}", file_reference, e)))?;
        debug!("Reading import file {}", path.display());
        Self::from_reader(file.into_std().await).await
    }

    /// Parse CSV from any reader. The header row is read before returning.
    pub async fn from_reader<R: Read + Send + 'static>(reader: R) -> Result<Self, JobError> {
        let (header_tx, header_rx) = oneshot::channel();
        let (row_tx, row_rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || read_csv(reader, header_tx, row_tx));

        let headers = header_rx
            .await
            .map_err(|_| JobError::Internal("CSV reader stopped before the header".to_string()))?
            .map_err(JobError::InvalidInput)?;

        let rows = stream::unfold(row_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn into_rows(self) -> BoxStream<'static, RowItem> {
        self.rows
    }
}

fn read_csv<R: Read>(
    reader: R,
    header_tx: oneshot::Sender<Result<Vec<String>, String>>,
    row_tx: mpsc::Sender<RowItem>,
) {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = match csv_reader.headers() {
        Ok(record) => record.iter().map(str::to_string).collect(),
        Err(e) => {
            let _ = header_tx.send(Err(format!("cannot read CSV header: {}", e)));
            return;
        }
    };
    if header_tx.send(Ok(headers)).is_err() {
        return;
    }

    // Data starts on line 2
    let mut next_line = 2u64;
    for record in csv_reader.records() {
        let item = match record {
            Ok(record) => {
                let row_number = record.position().map_or(next_line, |p| p.line());
                next_line = row_number + 1;
                Ok(RawRow {
                    row_number,
                    fields: record.iter().map(str::to_string).collect(),
                })
            }
            Err(e) => {
                let row_number = e.position().map_or(next_line, |p| p.line());
                next_line = row_number + 1;
                let fatal = e.is_io_error();
                let item = Err(UnreadableRow {
                    row_number,
                    message: e.to_string(),
                });
                if fatal {
                    let _ = row_tx.blocking_send(item);
                    return;
                }
                item
            }
        };

        // Receiver gone: the import was cancelled or failed
        if row_tx.blocking_send(item).is_err() {
            return;
        }
    }
}

/// Resolve a client-supplied path inside `upload_dir`.
///
/// Absolute paths and `..` components are rejected.
pub fn resolve_file_reference(upload_dir: &Path, file_reference: &str) -> Result<PathBuf, JobError> {
    let reference = Path::new(file_reference);
    if file_reference.trim().is_empty() {
        return Err(JobError::InvalidInput("file reference is empty".to_string()));
    }

    for component in reference.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(JobError::InvalidInput(format!(
                    "file reference '{}' must be a relative path inside the upload directory",
                    file_reference
                )));
            }
        }
    }

    Ok(upload_dir.join(reference))
}

/// Column mapping bound to field positions of a concrete header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub phone: usize,
    pub first_name: Option<usize>,
    pub last_name: Option<usize>,
    pub email: Option<usize>,
    pub status: Option<usize>,
}

impl ResolvedMapping {
    /// Bind names to positions. A missing phone column is an error, missing
    /// optional columns are dropped with a warning.
    pub fn resolve(mapping: &ColumnMapping, headers: &[String]) -> Result<Self, JobError> {
        let phone = find_column(&mapping.phone, headers).ok_or_else(|| {
            JobError::InvalidInput(format!("phone column {} not found in header", mapping.phone))
        })?;

        let optional = |field: &str, column: &Option<ColumnRef>| -> Option<usize> {
            let column = column.as_ref()?;
            let idx = find_column(column, headers);
            if idx.is_none() {
                warn!("{} column {} not found in header, ignoring", field, column);
            }
            idx
        };

        Ok(Self {
            phone,
            first_name: optional("first name", &mapping.first_name),
            last_name: optional("last name", &mapping.last_name),
            email: optional("email", &mapping.email),
            status: optional("status", &mapping.status),
        })
    }
}

fn find_column(column: &ColumnRef, headers: &[String]) -> Option<usize> {
    match column {
        ColumnRef::Position(idx) => Some(*idx),
        ColumnRef::Name(name) => {
            let wanted = normalize_header(name);
            headers.iter().position(|h| normalize_header(h) == wanted)
        }
    }
}

fn normalize_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}
