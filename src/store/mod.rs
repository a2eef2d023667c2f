//! Contact store abstraction
//!
//! Uses PostgreSQL in production and an in-memory store for tests and local
//! development. Selected by the `STORE_BACKEND` setting:
//! - "postgres" → `PgContactStore`
//! - "memory" → `MemoryContactStore`

mod memory;
mod postgres;

pub use memory::{FaultPlan, MemoryContactStore};
pub use postgres::PgContactStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    BatchWriteOutcome, Campaign, CampaignId, CampaignSubscriber, Contact, ContactCandidate,
    ContactId, ContactRef, CreatePhonebookRequest, DuplicatePolicy, LeaseKey, Phonebook,
    PhonebookId,
};

/// Durable storage for phonebooks, contacts, campaigns, subscribers and leases.
///
/// Every write method is one transaction: it either applies completely or not
/// at all.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn phonebook(&self, id: PhonebookId) -> Result<Option<Phonebook>, StoreError>;

    async fn create_phonebook(&self, request: &CreatePhonebookRequest) -> Result<Phonebook, StoreError>;

    /// Point lookup by the dedup key
    async fn find_contact(&self, phonebook_id: PhonebookId, phone: &str) -> Result<Option<Contact>, StoreError>;

    async fn count_contacts(&self, phonebook_id: PhonebookId) -> Result<u64, StoreError>;

    /// Insert or upsert one batch of candidates. The batch must not contain two
    /// candidates with the same phone.
    async fn write_contact_batch(
        &self,
        phonebook_id: PhonebookId,
        batch: &[ContactCandidate],
        policy: DuplicatePolicy,
    ) -> Result<BatchWriteOutcome, StoreError>;

    /// Campaign with its linked phonebooks in collection order
    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Campaigns in `started` status
    async fn started_campaigns(&self) -> Result<Vec<CampaignId>, StoreError>;

    /// Exclusion query: contacts of `phonebook_id` with id greater than `after`
    /// that have no subscriber row for `campaign_id`, ordered by contact id.
    async fn uncollected_contacts(
        &self,
        campaign_id: CampaignId,
        phonebook_id: PhonebookId,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<ContactRef>, StoreError>;

    /// Insert `pending` subscribers, ignoring contacts already subscribed.
    /// Returns the number of rows created.
    async fn insert_subscribers(&self, campaign_id: CampaignId, contacts: &[ContactRef]) -> Result<u64, StoreError>;

    async fn subscribers(&self, campaign_id: CampaignId) -> Result<Vec<CampaignSubscriber>, StoreError>;

    /// Take the lease for `key` if it is free, expired, or already held by `holder`
    async fn acquire_lease(&self, key: LeaseKey, holder: Uuid, ttl: Duration) -> Result<bool, StoreError>;

    /// Extend a lease still held by `holder`. Returns false if it was lost.
    async fn renew_lease(&self, key: LeaseKey, holder: Uuid, ttl: Duration) -> Result<bool, StoreError>;

    async fn release_lease(&self, key: LeaseKey, holder: Uuid) -> Result<(), StoreError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Create the store configured by `backend`
pub async fn create_store(backend: &str, database_url: Option<&str>) -> anyhow::Result<Arc<dyn ContactStore>> {
    match backend {
        "memory" => {
            tracing::warn!("Using in-memory contact store, data is lost on restart");
            Ok(Arc::new(MemoryContactStore::new()))
        }
        "postgres" => {
            let url = database_url
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set for the postgres store"))?;
            let pool = crate::db::create_pool(url).await?;
            crate::db::run_migrations(&pool).await?;
            Ok(Arc::new(PgContactStore::new(pool)))
        }
        other => anyhow::bail!("unknown STORE_BACKEND '{}' (expected 'postgres' or 'memory')", other),
    }
}
