//! PostgreSQL contact store

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::ContactStore;
use crate::db::queries;
use crate::error::StoreError;
use crate::types::{
    BatchWriteOutcome, Campaign, CampaignId, CampaignSubscriber, Contact, ContactCandidate,
    ContactId, ContactRef, CreatePhonebookRequest, DuplicatePolicy, LeaseKey, Phonebook,
    PhonebookId,
};

pub struct PgContactStore {
    pool: PgPool,
}

impl PgContactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactStore for PgContactStore {
    async fn phonebook(&self, id: PhonebookId) -> Result<Option<Phonebook>, StoreError> {
        Ok(queries::phonebook::get_phonebook(&self.pool, id).await?)
    }

    async fn create_phonebook(&self, request: &CreatePhonebookRequest) -> Result<Phonebook, StoreError> {
        Ok(queries::phonebook::create_phonebook(&self.pool, request).await?)
    }

    async fn find_contact(&self, phonebook_id: PhonebookId, phone: &str) -> Result<Option<Contact>, StoreError> {
        Ok(queries::contact::find_contact(&self.pool, phonebook_id, phone).await?)
    }

    async fn count_contacts(&self, phonebook_id: PhonebookId) -> Result<u64, StoreError> {
        let count = queries::contact::count_contacts(&self.pool, phonebook_id).await?;
        Ok(count.max(0) as u64)
    }

    async fn write_contact_batch(
        &self,
        phonebook_id: PhonebookId,
        batch: &[ContactCandidate],
        policy: DuplicatePolicy,
    ) -> Result<BatchWriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = queries::contact::upsert_contact_batch(&mut tx, phonebook_id, batch, policy).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(queries::campaign::get_campaign(&self.pool, id).await?)
    }

    async fn started_campaigns(&self) -> Result<Vec<CampaignId>, StoreError> {
        Ok(queries::campaign::list_started_campaigns(&self.pool).await?)
    }

    async fn uncollected_contacts(
        &self,
        campaign_id: CampaignId,
        phonebook_id: PhonebookId,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<ContactRef>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(queries::campaign::find_uncollected_contacts(&self.pool, campaign_id, phonebook_id, after, limit).await?)
    }

    async fn insert_subscribers(&self, campaign_id: CampaignId, contacts: &[ContactRef]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let added = queries::campaign::insert_subscribers(&mut tx, campaign_id, contacts).await?;
        tx.commit().await?;
        Ok(added)
    }

    async fn subscribers(&self, campaign_id: CampaignId) -> Result<Vec<CampaignSubscriber>, StoreError> {
        Ok(queries::campaign::list_subscribers(&self.pool, campaign_id).await?)
    }

    async fn acquire_lease(&self, key: LeaseKey, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        Ok(queries::lease::acquire_lease(&self.pool, key, holder, ttl.as_secs_f64()).await?)
    }

    async fn renew_lease(&self, key: LeaseKey, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        Ok(queries::lease::renew_lease(&self.pool, key, holder, ttl.as_secs_f64()).await?)
    }

    async fn release_lease(&self, key: LeaseKey, holder: Uuid) -> Result<(), StoreError> {
        Ok(queries::lease::release_lease(&self.pool, key, holder).await?)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
