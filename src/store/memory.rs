//! In-memory contact store
//!
//! Mirrors the PostgreSQL semantics (unique keys, batch atomicity, lease expiry)
//! and supports injected write faults so pipelines can be exercised against
//! outages without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::ContactStore;
use crate::error::StoreError;
use crate::types::{
    BatchWriteOutcome, Campaign, CampaignId, CampaignStatus, CampaignSubscriber, Contact,
    ContactCandidate, ContactId, ContactRef, CreatePhonebookRequest, DuplicatePolicy, LeaseKey,
    Phonebook, PhonebookId, SubscriberStatus,
};

/// Write faults to simulate
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Every batch write after this many successful ones fails with an outage
    pub fail_writes_after: Option<usize>,
    /// The next N batch writes fail with a transient fault, then writes recover
    pub transient_failures: usize,
    /// Panic inside the next batch write
    pub panic_on_write: bool,
    /// Every lease renewal fails with an outage
    pub fail_lease_renewals: bool,
}

#[derive(Default)]
struct FaultState {
    plan: FaultPlan,
    writes_done: usize,
}

#[derive(Default)]
struct State {
    next_id: i64,
    phonebooks: BTreeMap<PhonebookId, Phonebook>,
    contacts: BTreeMap<ContactId, Contact>,
    contact_keys: HashMap<(PhonebookId, String), ContactId>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    subscribers: BTreeMap<i64, CampaignSubscriber>,
    subscriber_keys: HashSet<(CampaignId, ContactId)>,
    leases: HashMap<LeaseKey, (Uuid, Instant)>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryContactStore {
    state: Mutex<State>,
    faults: Mutex<FaultState>,
    write_delay: Duration,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every batch write, to keep jobs running long enough to observe them
    #[cfg(test)]
    pub fn with_write_delay(write_delay: Duration) -> Self {
        Self {
            write_delay,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn set_faults(&self, plan: FaultPlan) {
        let mut faults = self.faults.lock();
        faults.plan = plan;
        faults.writes_done = 0;
    }

    #[cfg(test)]
    pub fn clear_faults(&self) {
        self.set_faults(FaultPlan::default());
    }

    /// Register a campaign linked to `phonebook_ids`, in that order
    #[cfg(test)]
    pub fn add_campaign(&self, name: &str, status: CampaignStatus, phonebook_ids: Vec<PhonebookId>) -> CampaignId {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.campaigns.insert(
            id,
            Campaign {
                id,
                name: name.to_string(),
                status,
                phonebook_ids,
            },
        );
        id
    }

    /// Delete a phonebook with its contacts and their subscribers
    #[cfg(test)]
    pub fn delete_phonebook(&self, id: PhonebookId) -> bool {
        let mut state = self.state.lock();
        if state.phonebooks.remove(&id).is_none() {
            return false;
        }
        let removed: Vec<ContactId> = state
            .contacts
            .values()
            .filter(|c| c.phonebook_id == id)
            .map(|c| c.id)
            .collect();
        for contact_id in &removed {
            if let Some(contact) = state.contacts.remove(contact_id) {
                state.contact_keys.remove(&(id, contact.phone));
            }
        }
        let removed: HashSet<ContactId> = removed.into_iter().collect();
        state.subscribers.retain(|_, s| !removed.contains(&s.contact_id));
        state.subscriber_keys.retain(|(_, contact_id)| !removed.contains(contact_id));
        for campaign in state.campaigns.values_mut() {
            campaign.phonebook_ids.retain(|pb| *pb != id);
        }
        true
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let mut faults = self.faults.lock();
        if faults.plan.panic_on_write {
            faults.plan.panic_on_write = false;
            drop(faults);
            panic!("simulated panic in batch write");
        }
        if faults.plan.transient_failures > 0 {
            faults.plan.transient_failures -= 1;
            return Err(StoreError::Contention("simulated serialization failure".to_string()));
        }
        if let Some(limit) = faults.plan.fail_writes_after {
            if faults.writes_done >= limit {
                return Err(StoreError::Unavailable("simulated connection loss".to_string()));
            }
        }
        Ok(())
    }

    fn after_write(&self) {
        self.faults.lock().writes_done += 1;
    }
}

fn apply_overwrite(contact: &mut Contact, candidate: &ContactCandidate, blank_overwrites: bool) {
    fn pick(current: &mut Option<String>, incoming: &Option<String>, blank_overwrites: bool) {
        if incoming.is_some() || blank_overwrites {
            *current = incoming.clone();
        }
    }
    pick(&mut contact.first_name, &candidate.first_name, blank_overwrites);
    pick(&mut contact.last_name, &candidate.last_name, blank_overwrites);
    pick(&mut contact.email, &candidate.email, blank_overwrites);
    pick(&mut contact.status, &candidate.status, blank_overwrites);
    contact.updated_at = Utc::now();
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn phonebook(&self, id: PhonebookId) -> Result<Option<Phonebook>, StoreError> {
        Ok(self.state.lock().phonebooks.get(&id).cloned())
    }

    async fn create_phonebook(&self, request: &CreatePhonebookRequest) -> Result<Phonebook, StoreError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let phonebook = Phonebook {
            id,
            name: request.name.clone(),
            description: request.description.clone(),
            account_id: request.account_id,
            created_at: Utc::now(),
        };
        state.phonebooks.insert(id, phonebook.clone());
        Ok(phonebook)
    }

    async fn find_contact(&self, phonebook_id: PhonebookId, phone: &str) -> Result<Option<Contact>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .contact_keys
            .get(&(phonebook_id, phone.to_string()))
            .and_then(|id| state.contacts.get(id))
            .cloned())
    }

    async fn count_contacts(&self, phonebook_id: PhonebookId) -> Result<u64, StoreError> {
        let state = self.state.lock();
        Ok(state.contacts.values().filter(|c| c.phonebook_id == phonebook_id).count() as u64)
    }

    async fn write_contact_batch(
        &self,
        phonebook_id: PhonebookId,
        batch: &[ContactCandidate],
        policy: DuplicatePolicy,
    ) -> Result<BatchWriteOutcome, StoreError> {
        self.before_write().await?;

        let mut state = self.state.lock();
        if !state.phonebooks.contains_key(&phonebook_id) {
            return Err(StoreError::Query(format!(
                "insert violates foreign key: phonebook {} does not exist",
                phonebook_id
            )));
        }

        let mut outcome = BatchWriteOutcome::default();
        for candidate in batch {
            let key = (phonebook_id, candidate.phone.clone());
            match state.contact_keys.get(&key).copied() {
                Some(existing_id) => match policy {
                    DuplicatePolicy::Skip => outcome.skipped += 1,
                    DuplicatePolicy::Overwrite { blank_overwrites } => {
                        if let Some(contact) = state.contacts.get_mut(&existing_id) {
                            apply_overwrite(contact, candidate, blank_overwrites);
                        }
                        outcome.updated += 1;
                    }
                },
                None => {
                    let id = state.next_id();
                    let now = Utc::now();
                    state.contacts.insert(
                        id,
                        Contact {
                            id,
                            phonebook_id,
                            phone: candidate.phone.clone(),
                            first_name: candidate.first_name.clone(),
                            last_name: candidate.last_name.clone(),
                            email: candidate.email.clone(),
                            status: candidate.status.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    state.contact_keys.insert(key, id);
                    outcome.inserted += 1;
                }
            }
        }
        drop(state);

        self.after_write();
        Ok(outcome)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.state.lock().campaigns.get(&id).cloned())
    }

    async fn started_campaigns(&self) -> Result<Vec<CampaignId>, StoreError> {
        Ok(self
            .state
            .lock()
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Started)
            .map(|c| c.id)
            .collect())
    }

    async fn uncollected_contacts(
        &self,
        campaign_id: CampaignId,
        phonebook_id: PhonebookId,
        after: Option<ContactId>,
        limit: usize,
    ) -> Result<Vec<ContactRef>, StoreError> {
        let state = self.state.lock();
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(state
            .contacts
            .range((lower, Bound::Unbounded))
            .map(|(_, c)| c)
            .filter(|c| c.phonebook_id == phonebook_id)
            .filter(|c| !state.subscriber_keys.contains(&(campaign_id, c.id)))
            .take(limit)
            .map(|c| ContactRef {
                contact_id: c.id,
                phonebook_id: c.phonebook_id,
                phone: c.phone.clone(),
            })
            .collect())
    }

    async fn insert_subscribers(&self, campaign_id: CampaignId, contacts: &[ContactRef]) -> Result<u64, StoreError> {
        self.before_write().await?;

        let mut state = self.state.lock();
        if !state.campaigns.contains_key(&campaign_id) {
            return Err(StoreError::Query(format!(
                "insert violates foreign key: campaign {} does not exist",
                campaign_id
            )));
        }

        let mut added = 0;
        for contact in contacts {
            if !state.subscriber_keys.insert((campaign_id, contact.contact_id)) {
                continue;
            }
            let id = state.next_id();
            state.subscribers.insert(
                id,
                CampaignSubscriber {
                    id,
                    campaign_id,
                    contact_id: contact.contact_id,
                    phone: contact.phone.clone(),
                    status: SubscriberStatus::Pending,
                    attempts: 0,
                    last_attempt_at: None,
                    created_at: Utc::now(),
                },
            );
            added += 1;
        }
        drop(state);

        self.after_write();
        Ok(added)
    }

    async fn subscribers(&self, campaign_id: CampaignId) -> Result<Vec<CampaignSubscriber>, StoreError> {
        Ok(self
            .state
            .lock()
            .subscribers
            .values()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn acquire_lease(&self, key: LeaseKey, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let held_by_other = matches!(
            state.leases.get(&key),
            Some((current, expires_at)) if *current != holder && *expires_at > now
        );
        if held_by_other {
            return Ok(false);
        }
        state.leases.insert(key, (holder, now + ttl));
        Ok(true)
    }

    async fn renew_lease(&self, key: LeaseKey, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        if self.faults.lock().plan.fail_lease_renewals {
            return Err(StoreError::Unavailable("simulated outage during lease renewal".to_string()));
        }
        let mut state = self.state.lock();
        match state.leases.get_mut(&key) {
            Some((current, expires_at)) if *current == holder => {
                *expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: LeaseKey, holder: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if matches!(state.leases.get(&key), Some((current, _)) if *current == holder) {
            state.leases.remove(&key);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
