//! Campaign and subscriber database queries

use sqlx::{PgPool, Postgres, Transaction};

use crate::types::{
    Campaign, CampaignId, CampaignStatus, CampaignSubscriber, ContactId, ContactRef, PhonebookId,
};

/// Get a campaign with its linked phonebooks in collection order
pub async fn get_campaign(pool: &PgPool, id: CampaignId) -> Result<Option<Campaign>, sqlx::Error> {
    let row: Option<(CampaignId, String, CampaignStatus)> =
        sqlx::query_as("SELECT id, name, status FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    let Some((id, name, status)) = row else {
        return Ok(None);
    };

    let phonebook_ids: Vec<PhonebookId> = sqlx::query_scalar(
        r#"SELECT phonebook_id FROM campaign_phonebooks
           WHERE campaign_id = $1
           ORDER BY position, phonebook_id"#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(Some(Campaign {
        id,
        name,
        status,
        phonebook_ids,
    }))
}

/// Ids of campaigns currently in `started` status
pub async fn list_started_campaigns(pool: &PgPool) -> Result<Vec<CampaignId>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM campaigns WHERE status = 'started' ORDER BY id")
        .fetch_all(pool)
        .await
}

/// Contacts of a phonebook not yet subscribed to the campaign, in id order,
/// starting after `after` (keyset pagination).
pub async fn find_uncollected_contacts(
    pool: &PgPool,
    campaign_id: CampaignId,
    phonebook_id: PhonebookId,
    after: Option<ContactId>,
    limit: i64,
) -> Result<Vec<ContactRef>, sqlx::Error> {
    sqlx::query_as::<_, ContactRef>(
        r#"SELECT c.id AS contact_id, c.phonebook_id, c.phone
           FROM contacts c
           WHERE c.phonebook_id = $2
             AND c.id > $3
             AND NOT EXISTS (
                 SELECT 1 FROM campaign_subscribers s
                 WHERE s.campaign_id = $1 AND s.contact_id = c.id
             )
           ORDER BY c.id
           LIMIT $4"#,
    )
    .bind(campaign_id)
    .bind(phonebook_id)
    .bind(after.unwrap_or(0))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Bulk insert `pending` subscribers; existing `(campaign, contact)` pairs are left untouched
pub async fn insert_subscribers(
    tx: &mut Transaction<'_, Postgres>,
    campaign_id: CampaignId,
    contacts: &[ContactRef],
) -> Result<u64, sqlx::Error> {
    if contacts.is_empty() {
        return Ok(0);
    }

    let contact_ids: Vec<ContactId> = contacts.iter().map(|c| c.contact_id).collect();
    let phones: Vec<String> = contacts.iter().map(|c| c.phone.clone()).collect();

    let result = sqlx::query(
        r#"INSERT INTO campaign_subscribers (campaign_id, contact_id, phone, status, attempts)
           SELECT $1, t.contact_id, t.phone, 'pending', 0
           FROM UNNEST($2::bigint[], $3::text[]) AS t(contact_id, phone)
           ON CONFLICT (campaign_id, contact_id) DO NOTHING"#,
    )
    .bind(campaign_id)
    .bind(&contact_ids)
    .bind(&phones)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

/// All subscribers of a campaign in creation order
pub async fn list_subscribers(pool: &PgPool, campaign_id: CampaignId) -> Result<Vec<CampaignSubscriber>, sqlx::Error> {
    sqlx::query_as::<_, CampaignSubscriber>(
        r#"SELECT id, campaign_id, contact_id, phone, status, attempts, last_attempt_at, created_at
           FROM campaign_subscribers
           WHERE campaign_id = $1
           ORDER BY id"#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await
}
