//! Phonebook database queries

use sqlx::PgPool;

use crate::types::{CreatePhonebookRequest, Phonebook, PhonebookId};

/// Get a phonebook by id
pub async fn get_phonebook(pool: &PgPool, id: PhonebookId) -> Result<Option<Phonebook>, sqlx::Error> {
    sqlx::query_as::<_, Phonebook>(
        r#"SELECT id, name, description, account_id, created_at
           FROM phonebooks
           WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Create a new phonebook
pub async fn create_phonebook(pool: &PgPool, request: &CreatePhonebookRequest) -> Result<Phonebook, sqlx::Error> {
    sqlx::query_as::<_, Phonebook>(
        r#"INSERT INTO phonebooks (name, description, account_id)
           VALUES ($1, $2, $3)
           RETURNING id, name, description, account_id, created_at"#,
    )
    .bind(&request.name)
    .bind(&request.description)
    .bind(request.account_id)
    .fetch_one(pool)
    .await
}
