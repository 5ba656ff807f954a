pub mod memory;
pub mod mongo;

use log::{error, info, warn};
use mongodb::bson::{oid::ObjectId, DateTime};
use mongodb::{Client, Database};
use rocket::fairing::AdHoc;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, StorageBackend};
use crate::models::{Subscription, SubscriptionStatus, UsageCategory, UsageLimits, UsageTracking};
use crate::services::period::SystemClock;
use crate::services::Services;

pub const SUBSCRIPTIONS: &str = "subscriptions";
pub const USAGE_LIMITS: &str = "usage_limits";
pub const USAGE_TRACKING: &str = "usage_tracking";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// A counter increment would exceed the counter's range.
    #[error("counter '{0}' would overflow")]
    Overflow(String),

    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[rocket::async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fails with `Duplicate` if the record is active and the user already holds an active one.
    async fn insert(&self, subscription: Subscription) -> StoreResult<Subscription>;

    async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<Subscription>>;

    async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<Subscription>>;

    async fn find_by_status(&self, status: SubscriptionStatus) -> StoreResult<Vec<Subscription>>;

    /// Subscriptions due for the expiry sweep at `now`: scheduled ones whose
    /// `cancel_at` has passed and active ones whose period has ended.
    async fn find_expired(&self, now: DateTime) -> StoreResult<Vec<Subscription>>;

    /// Replaces the stored record with `next` only if the stored `status` and
    /// `version` still equal those of `expected`. `Ok(None)` means the
    /// precondition no longer held.
    async fn replace_if_unchanged(
        &self,
        expected: &Subscription,
        next: &Subscription,
    ) -> StoreResult<Option<Subscription>>;

    async fn count_by_status(&self, status: SubscriptionStatus) -> StoreResult<u64>;
}

#[rocket::async_trait]
pub trait UsageLimitsStore: Send + Sync {
    /// Fails with `Duplicate` if an active plan already holds the name.
    async fn insert(&self, plan: UsageLimits) -> StoreResult<UsageLimits>;

    async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<UsageLimits>>;

    /// Every row carrying the name, active or soft-deleted.
    async fn find_by_plan_name(&self, plan_name: &str) -> StoreResult<Vec<UsageLimits>>;

    async fn find_all(&self, include_inactive: bool) -> StoreResult<Vec<UsageLimits>>;

    /// Replaces the stored record with `next` only if the stored `version` and
    /// `is_active` still equal those of `expected`. `Ok(None)` means the
    /// record is gone or was modified in between.
    async fn replace_if_unchanged(
        &self,
        expected: &UsageLimits,
        next: &UsageLimits,
    ) -> StoreResult<Option<UsageLimits>>;

    async fn delete(&self, id: &ObjectId) -> StoreResult<bool>;

    async fn count(&self) -> StoreResult<u64>;
}

#[rocket::async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically adds every delta to the current `(user_id, period)` record,
    /// creating it if needed. Day-windowed categories are also added under `day`.
    async fn increment(
        &self,
        user_id: &ObjectId,
        period: &str,
        day: &str,
        increments: &[(UsageCategory, i64)],
        now: DateTime,
    ) -> StoreResult<UsageTracking>;

    async fn find_current(&self, user_id: &ObjectId, period: &str) -> StoreResult<Option<UsageTracking>>;

    /// Current and superseded records of one period for a user.
    async fn find_for_period(&self, user_id: &ObjectId, period: &str) -> StoreResult<Vec<UsageTracking>>;

    async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<UsageTracking>>;

    async fn find_by_period(&self, period: &str) -> StoreResult<Vec<UsageTracking>>;

    /// Supersedes the current record of the period and inserts a zeroed one.
    async fn start_fresh(&self, user_id: &ObjectId, period: &str, now: DateTime) -> StoreResult<UsageTracking>;
}

#[derive(Clone)]
pub struct Stores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub usage_limits: Arc<dyn UsageLimitsStore>,
    pub usage: Arc<dyn UsageStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Stores {
            subscriptions: Arc::new(memory::MemorySubscriptionStore::default()),
            usage_limits: Arc::new(memory::MemoryUsageLimitsStore::default()),
            usage: Arc::new(memory::MemoryUsageStore::default()),
        }
    }

    pub async fn mongo(database: Database) -> Result<Self, mongodb::error::Error> {
        mongo::ensure_indexes(&database).await?;

        Ok(Stores {
            subscriptions: Arc::new(mongo::MongoSubscriptionStore::new(&database)),
            usage_limits: Arc::new(mongo::MongoUsageLimitsStore::new(&database)),
            usage: Arc::new(mongo::MongoUsageStore::new(&database)),
        })
    }
}

pub fn init() -> AdHoc {
    AdHoc::try_on_ignite("Storage", |rocket| async {
        let stores = match Config::storage_backend() {
            StorageBackend::Memory => {
                warn!("Using in-memory storage; data is lost on restart");
                Stores::memory()
            }
            StorageBackend::MongoDb => match connect().await {
                Ok(database) => match Stores::mongo(database).await {
                    Ok(stores) => {
                        info!("✓ MongoDB connected successfully");
                        stores
                    }
                    Err(e) => {
                        error!("✗ Failed to prepare MongoDB indexes: {}", e);
                        return Err(rocket);
                    }
                },
                Err(e) => {
                    error!("✗ Failed to connect to MongoDB: {}", e);
                    return Err(rocket);
                }
            },
        };

        let services = Services::new(stores, Arc::new(SystemClock));

        match services.catalog.seed_default_plans().await {
            Ok(0) => {}
            Ok(seeded) => info!("Seeded {} default plans", seeded),
            Err(e) => error!("Failed to seed default plans: {}", e),
        }

        Ok(services.manage(rocket))
    })
}

async fn connect() -> Result<Database, mongodb::error::Error> {
    let uri = Config::mongodb_uri();
    let client = Client::with_uri_str(&uri).await?;

    // Test connection
    client
        .database("admin")
        .run_command(mongodb::bson::doc! {"ping": 1}, None)
        .await?;

    Ok(client.database(&Config::database_name()))
}
