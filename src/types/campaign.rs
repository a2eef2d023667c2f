//! Campaign and subscriber types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phonebook::{ContactId, PhonebookId};

pub type CampaignId = i64;

/// Campaign lifecycle as maintained by the campaign management layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "campaign_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Started,
    Paused,
    Aborted,
    Ended,
}

/// Campaign with its linked phonebooks in collection order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub status: CampaignStatus,
    pub phonebook_ids: Vec<PhonebookId>,
}

/// Dial state of a subscriber. Only `Pending` is ever written here;
/// the dialing engine owns the other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscriber_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Pending,
    Dialing,
    Completed,
    Failed,
}

/// One scheduled dial target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSubscriber {
    pub id: i64,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub phone: String,
    pub status: SubscriberStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Result of a collection run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectResult {
    pub subscribers_added: u64,
    pub phonebooks_scanned: u32,
    pub batches_committed: u32,
    pub aborted: bool,
}
