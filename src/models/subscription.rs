use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

use crate::services::period::to_rfc3339;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    ScheduledToCancel,
    Cancelled,
    Inactive,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 4] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::ScheduledToCancel,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Inactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::ScheduledToCancel => "scheduled_to_cancel",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        SubscriptionStatus::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    /// Scheduled-to-cancel subscriptions stay entitled until the period ends.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::ScheduledToCancel)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Subscription {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: ObjectId,
    pub plan_name: String, // references usage_limits.plan_name
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime,
    pub current_period_end: DateTime,
    pub cancel_at: Option<DateTime>,
    pub cancelled_at: Option<DateTime>,
    // bumped on every write, checked by conditional replaces
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// Field-level overwrite for a subscription. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionUpdate {
    pub plan_name: Option<String>,
    pub current_period_start: Option<chrono::DateTime<chrono::Utc>>,
    pub current_period_end: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct CreateSubscriptionDto {
    #[validate(length(equal = 24, message = "user_id must be a 24 character hex id"))]
    pub user_id: String,
    #[validate(length(min = 1, max = 64, message = "Plan name must be 1-64 characters"))]
    pub plan_name: String,
    pub current_period_start: chrono::DateTime<chrono::Utc>,
    pub current_period_end: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RenewSubscriptionDto {
    pub new_period_end: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct SubscriptionResponse {
    pub id: String,
    pub user_id: String,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    pub current_period_start: String,
    pub current_period_end: String,
    pub cancel_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        SubscriptionResponse {
            id: sub.id.map(|id| id.to_hex()).unwrap_or_default(),
            user_id: sub.user_id.to_hex(),
            plan_name: sub.plan_name,
            status: sub.status,
            current_period_start: to_rfc3339(sub.current_period_start),
            current_period_end: to_rfc3339(sub.current_period_end),
            cancel_at: sub.cancel_at.map(to_rfc3339),
            cancelled_at: sub.cancelled_at.map(to_rfc3339),
            created_at: to_rfc3339(sub.created_at),
            updated_at: to_rfc3339(sub.updated_at),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct SubscriptionStats {
    pub counts: BTreeMap<SubscriptionStatus, u64>,
    pub total: u64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct SweepFailure {
    pub subscription_id: String,
    pub error: String,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub transitioned: Vec<Subscription>,
    pub failed: Vec<SweepFailure>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct SweepReportResponse {
    pub transitioned: Vec<SubscriptionResponse>,
    pub failed: Vec<SweepFailure>,
}

impl From<SweepReport> for SweepReportResponse {
    fn from(report: SweepReport) -> Self {
        SweepReportResponse {
            transitioned: report.transitioned.into_iter().map(Into::into).collect(),
            failed: report.failed,
        }
    }
}
