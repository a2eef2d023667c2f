//! Contact database queries

use sqlx::{PgPool, Postgres, Transaction};

use crate::types::{BatchWriteOutcome, Contact, ContactCandidate, DuplicatePolicy, PhonebookId};

const CONTACT_COLUMNS: &str =
    "id, phonebook_id, phone, first_name, last_name, email, status, created_at, updated_at";

/// Find a contact by its dedup key
pub async fn find_contact(pool: &PgPool, phonebook_id: PhonebookId, phone: &str) -> Result<Option<Contact>, sqlx::Error> {
    sqlx::query_as::<_, Contact>(&format!(
        "SELECT {} FROM contacts WHERE phonebook_id = $1 AND phone = $2",
        CONTACT_COLUMNS
    ))
    .bind(phonebook_id)
    .bind(phone)
    .fetch_optional(pool)
    .await
}

/// Count contacts in a phonebook
pub async fn count_contacts(pool: &PgPool, phonebook_id: PhonebookId) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM contacts WHERE phonebook_id = $1")
        .bind(phonebook_id)
        .fetch_one(pool)
        .await
}

/// Column arrays for an UNNEST bulk insert
struct ContactColumns {
    phones: Vec<String>,
    first_names: Vec<Option<String>>,
    last_names: Vec<Option<String>>,
    emails: Vec<Option<String>>,
    statuses: Vec<Option<String>>,
}

impl ContactColumns {
    fn from_batch(batch: &[ContactCandidate]) -> Self {
        let mut columns = Self {
            phones: Vec::with_capacity(batch.len()),
            first_names: Vec::with_capacity(batch.len()),
            last_names: Vec::with_capacity(batch.len()),
            emails: Vec::with_capacity(batch.len()),
            statuses: Vec::with_capacity(batch.len()),
        };
        for candidate in batch {
            columns.phones.push(candidate.phone.clone());
            columns.first_names.push(candidate.first_name.clone());
            columns.last_names.push(candidate.last_name.clone());
            columns.emails.push(candidate.email.clone());
            columns.statuses.push(candidate.status.clone());
        }
        columns
    }
}

fn upsert_sql(policy: DuplicatePolicy) -> &'static str {
    match policy {
        DuplicatePolicy::Skip => {
            r#"INSERT INTO contacts (phonebook_id, phone, first_name, last_name, email, status)
               SELECT $1, t.phone, t.first_name, t.last_name, t.email, t.status
               FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
                    AS t(phone, first_name, last_name, email, status)
               ON CONFLICT (phonebook_id, phone) DO NOTHING
               RETURNING TRUE"#
        }
        DuplicatePolicy::Overwrite { blank_overwrites: false } => {
            r#"INSERT INTO contacts (phonebook_id, phone, first_name, last_name, email, status)
               SELECT $1, t.phone, t.first_name, t.last_name, t.email, t.status
               FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
                    AS t(phone, first_name, last_name, email, status)
               ON CONFLICT (phonebook_id, phone) DO UPDATE
               SET first_name = COALESCE(EXCLUDED.first_name, contacts.first_name),
                   last_name = COALESCE(EXCLUDED.last_name, contacts.last_name),
                   email = COALESCE(EXCLUDED.email, contacts.email),
                   status = COALESCE(EXCLUDED.status, contacts.status),
                   updated_at = NOW()
               RETURNING (xmax = 0)"#
        }
        DuplicatePolicy::Overwrite { blank_overwrites: true } => {
            r#"INSERT INTO contacts (phonebook_id, phone, first_name, last_name, email, status)
               SELECT $1, t.phone, t.first_name, t.last_name, t.email, t.status
               FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
                    AS t(phone, first_name, last_name, email, status)
               ON CONFLICT (phonebook_id, phone) DO UPDATE
               SET first_name = EXCLUDED.first_name,
                   last_name = EXCLUDED.last_name,
                   email = EXCLUDED.email,
                   status = EXCLUDED.status,
                   updated_at = NOW()
               RETURNING (xmax = 0)"#
        }
    }
}

/// Write one batch of candidates with a single bulk statement.
///
/// Every returned row is an inserted (`true`) or updated (`false`) contact;
/// candidates missing from the output hit an existing key under the skip policy.
pub async fn upsert_contact_batch(
    tx: &mut Transaction<'_, Postgres>,
    phonebook_id: PhonebookId,
    batch: &[ContactCandidate],
    policy: DuplicatePolicy,
) -> Result<BatchWriteOutcome, sqlx::Error> {
    if batch.is_empty() {
        return Ok(BatchWriteOutcome::default());
    }

    let columns = ContactColumns::from_batch(batch);
    let written: Vec<bool> = sqlx::query_scalar(upsert_sql(policy))
        .bind(phonebook_id)
        .bind(&columns.phones)
        .bind(&columns.first_names)
        .bind(&columns.last_names)
        .bind(&columns.emails)
        .bind(&columns.statuses)
        .fetch_all(&mut **tx)
        .await?;

    let inserted = written.iter().filter(|inserted| **inserted).count() as u64;
    let updated = written.len() as u64 - inserted;
    Ok(BatchWriteOutcome {
        inserted,
        updated,
        skipped: batch.len() as u64 - written.len() as u64,
    })
}
