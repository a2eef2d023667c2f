//! Campaign subscriber collection
//!
//! For each phonebook linked to a campaign, pages through the contacts that
//! have no subscriber row yet (the anti-join runs in the store) and inserts
//! them as `pending` subscribers, one transaction per page. Nothing is tracked
//! between runs: a retry simply finds a smaller missing set.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::cancellation::RunControl;
use super::retry::{retry_transient, RetryPolicy};
use crate::error::{Interrupted, JobError};
use crate::store::ContactStore;
use crate::types::{CampaignId, CollectResult, JobProgress, PhonebookId};

#[derive(Debug, Clone)]
pub struct CollectSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for CollectSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct SubscriberCollector {
    store: Arc<dyn ContactStore>,
    settings: CollectSettings,
}

impl SubscriberCollector {
    pub fn new(store: Arc<dyn ContactStore>, settings: CollectSettings) -> Self {
        Self { store, settings }
    }

    pub async fn run(
        &self,
        campaign_id: CampaignId,
        control: &RunControl,
    ) -> Result<CollectResult, Interrupted<CollectResult>> {
        let mut result = CollectResult::default();

        let campaign = retry_transient(&self.settings.retry, "load campaign", || {
            self.store.campaign(campaign_id)
        })
        .await
        .map_err(|e| interrupt(&result, e.into()))?
        .ok_or_else(|| interrupt(&result, JobError::NotFound(format!("campaign {}", campaign_id))))?;

        debug!(
            "Collecting subscribers for campaign {} ({}) from phonebooks {:?}",
            campaign.id, campaign.name, campaign.phonebook_ids
        );

        let mut rows_processed = 0u64;
        for &phonebook_id in &campaign.phonebook_ids {
            self.collect_phonebook(campaign_id, phonebook_id, &mut result, &mut rows_processed, control)
                .await?;
            result.phonebooks_scanned += 1;
        }

        info!(
            "Campaign {} collection finished: {} subscribers added from {} phonebooks in {} batches",
            campaign_id, result.subscribers_added, result.phonebooks_scanned, result.batches_committed
        );
        Ok(result)
    }

    async fn collect_phonebook(
        &self,
        campaign_id: CampaignId,
        phonebook_id: PhonebookId,
        result: &mut CollectResult,
        rows_processed: &mut u64,
        control: &RunControl,
    ) -> Result<(), Interrupted<CollectResult>> {
        let batch_size = self.settings.batch_size.max(1);
        let mut cursor = None;

        loop {
            if control.is_cancelled() {
                info!(
                    "Campaign {} collection cancelled after {} batches",
                    campaign_id, result.batches_committed
                );
                return Err(interrupt(result, JobError::Cancelled));
            }

            let page = retry_transient(&self.settings.retry, "find uncollected contacts", || {
                self.store.uncollected_contacts(campaign_id, phonebook_id, cursor, batch_size)
            })
            .await
            .map_err(|e| self.store_failure(campaign_id, result, e.into()))?;

            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.contact_id);

            let added = retry_transient(&self.settings.retry, "insert subscribers", || {
                self.store.insert_subscribers(campaign_id, &page)
            })
            .await
            .map_err(|e| self.store_failure(campaign_id, result, e.into()))?;

            result.subscribers_added += added;
            result.batches_committed += 1;
            *rows_processed += page.len() as u64;
            control.report(JobProgress {
                batches_committed: result.batches_committed,
                rows_processed: *rows_processed,
            });

            if page.len() < batch_size {
                break;
            }
        }

        Ok(())
    }

    fn store_failure(&self, campaign_id: CampaignId, result: &CollectResult, cause: JobError) -> Interrupted<CollectResult> {
        warn!(
            "Campaign {} collection stopped after {} batches: {}",
            campaign_id, result.batches_committed, cause
        );
        interrupt(result, cause)
    }
}

fn interrupt(result: &CollectResult, cause: JobError) -> Interrupted<CollectResult> {
    Interrupted {
        partial: CollectResult {
            aborted: true,
            ..result.clone()
        },
        cause,
    }
}
