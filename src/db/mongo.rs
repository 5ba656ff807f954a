use mongodb::bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Collection, Database, IndexModel};
use rocket::futures::TryStreamExt;

use crate::db::{
    StoreError, StoreResult, SubscriptionStore, UsageLimitsStore, UsageStore, SUBSCRIPTIONS,
    USAGE_LIMITS, USAGE_TRACKING,
};
use crate::models::{
    Subscription, SubscriptionStatus, UsageCategory, UsageLimits, UsageTracking, UsageWindow,
};

const DUPLICATE_KEY: i32 = 11000;
// server refuses an `$inc` whose result leaves the int64 range
const BAD_VALUE: i32 = 2;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn is_bad_value(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == BAD_VALUE,
        ErrorKind::Command(e) => e.code == BAD_VALUE,
        _ => false,
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if is_duplicate_key(&err) {
            StoreError::Duplicate(err.to_string())
        } else {
            StoreError::Backend(format!("Database error: {}", err))
        }
    }
}

/// Unique partial indexes backing the per-user and per-plan invariants.
pub async fn ensure_indexes(db: &Database) -> Result<(), mongodb::error::Error> {
    db.collection::<Document>(SUBSCRIPTIONS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "user_id": 1 })
                .options(
                    IndexOptions::builder()
                        .name("one_active_subscription_per_user".to_string())
                        .unique(true)
                        .partial_filter_expression(doc! { "status": "active" })
                        .build(),
                )
                .build(),
            None,
        )
        .await?;

    db.collection::<Document>(SUBSCRIPTIONS)
        .create_index(
            IndexModel::builder().keys(doc! { "status": 1, "current_period_end": 1 }).build(),
            None,
        )
        .await?;

    db.collection::<Document>(USAGE_LIMITS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "plan_name": 1 })
                .options(
                    IndexOptions::builder()
                        .name("one_active_plan_per_name".to_string())
                        .unique(true)
                        .partial_filter_expression(doc! { "is_active": true })
                        .build(),
                )
                .build(),
            None,
        )
        .await?;

    db.collection::<Document>(USAGE_TRACKING)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "user_id": 1, "period": 1 })
                .options(
                    IndexOptions::builder()
                        .name("one_current_record_per_period".to_string())
                        .unique(true)
                        .partial_filter_expression(doc! { "is_current": true })
                        .build(),
                )
                .build(),
            None,
        )
        .await?;

    Ok(())
}

async fn collect<T>(cursor: mongodb::Cursor<T>) -> StoreResult<Vec<T>>
where
    T: serde::de::DeserializeOwned + Unpin + Send + Sync,
{
    cursor
        .try_collect()
        .await
        .map_err(|e| StoreError::Backend(format!("Cursor error: {}", e)))
}

fn inserted_id(result: &mongodb::results::InsertOneResult) -> StoreResult<ObjectId> {
    result
        .inserted_id
        .as_object_id()
        .ok_or_else(|| StoreError::Backend("Invalid inserted ID".to_string()))
}

/* ----------------------------- SUBSCRIPTIONS ----------------------------- */

pub struct MongoSubscriptionStore {
    collection: Collection<Subscription>,
}

impl MongoSubscriptionStore {
    pub fn new(db: &Database) -> Self {
        MongoSubscriptionStore {
            collection: db.collection::<Subscription>(SUBSCRIPTIONS),
        }
    }
}

#[rocket::async_trait]
impl SubscriptionStore for MongoSubscriptionStore {
    async fn insert(&self, mut subscription: Subscription) -> StoreResult<Subscription> {
        let result = self.collection.insert_one(&subscription, None).await?;
        subscription.id = Some(inserted_id(&result)?);
        Ok(subscription)
    }

    async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<Subscription>> {
        Ok(self.collection.find_one(doc! { "_id": id }, None).await?)
    }

    async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<Subscription>> {
        let options = FindOptions::builder().sort(doc! { "updated_at": -1 }).build();
        let cursor = self.collection.find(doc! { "user_id": user_id }, options).await?;
        collect(cursor).await
    }

    async fn find_by_status(&self, status: SubscriptionStatus) -> StoreResult<Vec<Subscription>> {
        let options = FindOptions::builder().sort(doc! { "updated_at": -1 }).build();
        let cursor = self.collection.find(doc! { "status": status.as_str() }, options).await?;
        collect(cursor).await
    }

    async fn find_expired(&self, now: DateTime) -> StoreResult<Vec<Subscription>> {
        let filter = doc! {
            "$or": [
                {
                    "status": SubscriptionStatus::ScheduledToCancel.as_str(),
                    "cancel_at": { "$lte": now }
                },
                {
                    "status": SubscriptionStatus::Active.as_str(),
                    "current_period_end": { "$lte": now }
                }
            ]
        };
        let cursor = self.collection.find(filter, None).await?;
        collect(cursor).await
    }

    async fn replace_if_unchanged(
        &self,
        expected: &Subscription,
        next: &Subscription,
    ) -> StoreResult<Option<Subscription>> {
        let filter = doc! {
            "_id": expected.id,
            "status": expected.status.as_str(),
            "version": expected.version,
        };
        let options = FindOneAndReplaceOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        Ok(self.collection.find_one_and_replace(filter, next, options).await?)
    }

    async fn count_by_status(&self, status: SubscriptionStatus) -> StoreResult<u64> {
        Ok(self
            .collection
            .count_documents(doc! { "status": status.as_str() }, None)
            .await?)
    }
}

/* ----------------------------- USAGE LIMITS ----------------------------- */

pub struct MongoUsageLimitsStore {
    collection: Collection<UsageLimits>,
}

impl MongoUsageLimitsStore {
    pub fn new(db: &Database) -> Self {
        MongoUsageLimitsStore {
            collection: db.collection::<UsageLimits>(USAGE_LIMITS),
        }
    }
}

#[rocket::async_trait]
impl UsageLimitsStore for MongoUsageLimitsStore {
    async fn insert(&self, mut plan: UsageLimits) -> StoreResult<UsageLimits> {
        let result = self.collection.insert_one(&plan, None).await?;
        plan.id = Some(inserted_id(&result)?);
        Ok(plan)
    }

    async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<UsageLimits>> {
        Ok(self.collection.find_one(doc! { "_id": id }, None).await?)
    }

    async fn find_by_plan_name(&self, plan_name: &str) -> StoreResult<Vec<UsageLimits>> {
        let options = FindOptions::builder().sort(doc! { "updated_at": -1 }).build();
        let cursor = self.collection.find(doc! { "plan_name": plan_name }, options).await?;
        collect(cursor).await
    }

    async fn find_all(&self, include_inactive: bool) -> StoreResult<Vec<UsageLimits>> {
        let filter = if include_inactive { doc! {} } else { doc! { "is_active": true } };
        let options = FindOptions::builder().sort(doc! { "plan_name": 1 }).build();
        let cursor = self.collection.find(filter, options).await?;
        collect(cursor).await
    }

    async fn replace_if_unchanged(
        &self,
        expected: &UsageLimits,
        next: &UsageLimits,
    ) -> StoreResult<Option<UsageLimits>> {
        let filter = doc! {
            "_id": expected.id,
            "version": expected.version,
            "is_active": expected.is_active,
        };
        let options = FindOneAndReplaceOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        Ok(self.collection.find_one_and_replace(filter, next, options).await?)
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        let result = self.collection.delete_one(doc! { "_id": id }, None).await?;
        Ok(result.deleted_count > 0)
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.collection.count_documents(doc! {}, None).await?)
    }
}

/* ----------------------------- USAGE TRACKING ----------------------------- */

pub struct MongoUsageStore {
    collection: Collection<UsageTracking>,
}

impl MongoUsageStore {
    pub fn new(db: &Database) -> Self {
        MongoUsageStore {
            collection: db.collection::<UsageTracking>(USAGE_TRACKING),
        }
    }

    async fn upsert_increment(
        &self,
        user_id: &ObjectId,
        period: &str,
        update: Document,
    ) -> Result<Option<UsageTracking>, mongodb::error::Error> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        self.collection
            .find_one_and_update(
                doc! { "user_id": user_id, "period": period, "is_current": true },
                update,
                options,
            )
            .await
    }
}

fn increment_update(day: &str, increments: &[(UsageCategory, i64)], now: DateTime) -> Document {
    let mut inc = Document::new();
    for (category, delta) in increments {
        inc.insert(format!("counters.{}", category.as_str()), *delta);
        if category.window() == UsageWindow::Day {
            inc.insert(format!("daily_counters.{}.{}", day, category.as_str()), *delta);
        }
    }

    doc! {
        "$inc": inc,
        "$set": { "updated_at": now },
        "$setOnInsert": {
            "created_at": now,
            "is_reset": false,
            "superseded_at": Bson::Null,
        }
    }
}

#[rocket::async_trait]
impl UsageStore for MongoUsageStore {
    async fn increment(
        &self,
        user_id: &ObjectId,
        period: &str,
        day: &str,
        increments: &[(UsageCategory, i64)],
        now: DateTime,
    ) -> StoreResult<UsageTracking> {
        let update = increment_update(day, increments, now);

        // Two concurrent upserts can both miss and race on the unique index;
        // the loser retries and then matches the winner's document.
        let updated = match self.upsert_increment(user_id, period, update.clone()).await {
            Err(e) if is_duplicate_key(&e) => self.upsert_increment(user_id, period, update).await,
            other => other,
        }
        .map_err(|e| {
            if is_bad_value(&e) {
                StoreError::Overflow(increments.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>().join(", "))
            } else {
                e.into()
            }
        })?;

        updated.ok_or_else(|| StoreError::Backend("Upsert returned no document".to_string()))
    }

    async fn find_current(&self, user_id: &ObjectId, period: &str) -> StoreResult<Option<UsageTracking>> {
        Ok(self
            .collection
            .find_one(doc! { "user_id": user_id, "period": period, "is_current": true }, None)
            .await?)
    }

    async fn find_for_period(&self, user_id: &ObjectId, period: &str) -> StoreResult<Vec<UsageTracking>> {
        let options = FindOptions::builder().sort(doc! { "created_at": 1 }).build();
        let cursor = self
            .collection
            .find(doc! { "user_id": user_id, "period": period }, options)
            .await?;
        collect(cursor).await
    }

    async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<UsageTracking>> {
        let options = FindOptions::builder().sort(doc! { "period": 1, "created_at": 1 }).build();
        let cursor = self.collection.find(doc! { "user_id": user_id }, options).await?;
        collect(cursor).await
    }

    async fn find_by_period(&self, period: &str) -> StoreResult<Vec<UsageTracking>> {
        let cursor = self.collection.find(doc! { "period": period }, None).await?;
        collect(cursor).await
    }

    async fn start_fresh(&self, user_id: &ObjectId, period: &str, now: DateTime) -> StoreResult<UsageTracking> {
        self.collection
            .update_many(
                doc! { "user_id": user_id, "period": period, "is_current": true },
                doc! { "$set": { "is_current": false, "superseded_at": now, "updated_at": now } },
                None,
            )
            .await?;

        let mut record = UsageTracking::empty(*user_id, period.to_string(), now);
        record.is_reset = true;

        match self.collection.insert_one(&record, None).await {
            Ok(result) => {
                record.id = Some(inserted_id(&result)?);
                Ok(record)
            }
            // an increment recreated the current record in between; it is the fresh one
            Err(e) if is_duplicate_key(&e) => self
                .find_current(user_id, period)
                .await?
                .ok_or_else(|| StoreError::Backend("Current usage record vanished".to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
