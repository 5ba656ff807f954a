use mongodb::bson::{oid::ObjectId, DateTime};
use std::sync::{Mutex, MutexGuard};

use crate::db::{StoreError, StoreResult, SubscriptionStore, UsageLimitsStore, UsageStore};
use crate::models::{Subscription, SubscriptionStatus, UsageCategory, UsageLimits, UsageTracking};

// One mutex per collection. Every trait method runs entirely under the lock,
// which gives the same per-document atomicity the MongoDB store relies on.

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
}

#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: Mutex<Vec<Subscription>>,
}

fn conflicting_active(rows: &[Subscription], candidate: &Subscription) -> bool {
    candidate.status == SubscriptionStatus::Active
        && rows.iter().any(|row| {
            row.user_id == candidate.user_id
                && row.status == SubscriptionStatus::Active
                && row.id != candidate.id
        })
}

#[rocket::async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn insert(&self, mut subscription: Subscription) -> StoreResult<Subscription> {
        let mut rows = lock(&self.rows)?;
        subscription.id.get_or_insert_with(ObjectId::new);

        if conflicting_active(&rows, &subscription) {
            return Err(StoreError::Duplicate(format!(
                "user {} already has an active subscription",
                subscription.user_id.to_hex()
            )));
        }

        rows.push(subscription.clone());
        Ok(subscription)
    }

    async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<Subscription>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().find(|row| row.id.as_ref() == Some(id)).cloned())
    }

    async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<Subscription>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().filter(|row| &row.user_id == user_id).cloned().collect())
    }

    async fn find_by_status(&self, status: SubscriptionStatus) -> StoreResult<Vec<Subscription>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().filter(|row| row.status == status).cloned().collect())
    }

    async fn find_expired(&self, now: DateTime) -> StoreResult<Vec<Subscription>> {
        let rows = lock(&self.rows)?;
        Ok(rows
            .iter()
            .filter(|row| match row.status {
                SubscriptionStatus::ScheduledToCancel => row.cancel_at.is_some_and(|at| at <= now),
                SubscriptionStatus::Active => row.current_period_end <= now,
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn replace_if_unchanged(
        &self,
        expected: &Subscription,
        next: &Subscription,
    ) -> StoreResult<Option<Subscription>> {
        let mut rows = lock(&self.rows)?;

        let Some(index) = rows.iter().position(|row| row.id == expected.id) else {
            return Ok(None);
        };

        let stored = &rows[index];
        if stored.status != expected.status || stored.version != expected.version {
            return Ok(None);
        }

        if conflicting_active(&rows, next) {
            return Err(StoreError::Duplicate(format!(
                "user {} already has an active subscription",
                next.user_id.to_hex()
            )));
        }

        rows[index] = next.clone();
        Ok(Some(next.clone()))
    }

    async fn count_by_status(&self, status: SubscriptionStatus) -> StoreResult<u64> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().filter(|row| row.status == status).count() as u64)
    }
}

#[derive(Default)]
pub struct MemoryUsageLimitsStore {
    rows: Mutex<Vec<UsageLimits>>,
}

fn conflicting_plan(rows: &[UsageLimits], candidate: &UsageLimits) -> bool {
    candidate.is_active
        && rows.iter().any(|row| {
            row.is_active && row.plan_name == candidate.plan_name && row.id != candidate.id
        })
}

#[rocket::async_trait]
impl UsageLimitsStore for MemoryUsageLimitsStore {
    async fn insert(&self, mut plan: UsageLimits) -> StoreResult<UsageLimits> {
        let mut rows = lock(&self.rows)?;
        plan.id.get_or_insert_with(ObjectId::new);

        if conflicting_plan(&rows, &plan) {
            return Err(StoreError::Duplicate(format!("plan '{}' already exists", plan.plan_name)));
        }

        rows.push(plan.clone());
        Ok(plan)
    }

    async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<UsageLimits>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().find(|row| row.id.as_ref() == Some(id)).cloned())
    }

    async fn find_by_plan_name(&self, plan_name: &str) -> StoreResult<Vec<UsageLimits>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().filter(|row| row.plan_name == plan_name).cloned().collect())
    }

    async fn find_all(&self, include_inactive: bool) -> StoreResult<Vec<UsageLimits>> {
        let rows = lock(&self.rows)?;
        Ok(rows
            .iter()
            .filter(|row| include_inactive || row.is_active)
            .cloned()
            .collect())
    }

    async fn replace_if_unchanged(
        &self,
        expected: &UsageLimits,
        next: &UsageLimits,
    ) -> StoreResult<Option<UsageLimits>> {
        let mut rows = lock(&self.rows)?;

        let Some(index) = rows.iter().position(|row| row.id == expected.id) else {
            return Ok(None);
        };

        let stored = &rows[index];
        if stored.version != expected.version || stored.is_active != expected.is_active {
            return Ok(None);
        }

        if conflicting_plan(&rows, next) {
            return Err(StoreError::Duplicate(format!("plan '{}' already exists", next.plan_name)));
        }

        rows[index] = next.clone();
        Ok(Some(next.clone()))
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<bool> {
        let mut rows = lock(&self.rows)?;
        let before = rows.len();
        rows.retain(|row| row.id.as_ref() != Some(id));
        Ok(rows.len() != before)
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(lock(&self.rows)?.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryUsageStore {
    rows: Mutex<Vec<UsageTracking>>,
}

fn is_current_for(row: &UsageTracking, user_id: &ObjectId, period: &str) -> bool {
    row.is_current && &row.user_id == user_id && row.period == period
}

#[rocket::async_trait]
impl UsageStore for MemoryUsageStore {
    async fn increment(
        &self,
        user_id: &ObjectId,
        period: &str,
        day: &str,
        increments: &[(UsageCategory, i64)],
        now: DateTime,
    ) -> StoreResult<UsageTracking> {
        let mut rows = lock(&self.rows)?;

        let existing = rows.iter().position(|row| is_current_for(row, user_id, period));
        let mut record = match existing {
            Some(index) => rows[index].clone(),
            None => {
                let mut record = UsageTracking::empty(*user_id, period.to_string(), now);
                record.id = Some(ObjectId::new());
                record
            }
        };

        record
            .apply_increments(increments, day)
            .map_err(|category| StoreError::Overflow(category.to_string()))?;
        record.updated_at = now;

        match existing {
            Some(index) => rows[index] = record.clone(),
            None => rows.push(record.clone()),
        }
        Ok(record)
    }

    async fn find_current(&self, user_id: &ObjectId, period: &str) -> StoreResult<Option<UsageTracking>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().find(|row| is_current_for(row, user_id, period)).cloned())
    }

    async fn find_for_period(&self, user_id: &ObjectId, period: &str) -> StoreResult<Vec<UsageTracking>> {
        let rows = lock(&self.rows)?;
        Ok(rows
            .iter()
            .filter(|row| &row.user_id == user_id && row.period == period)
            .cloned()
            .collect())
    }

    async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<UsageTracking>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().filter(|row| &row.user_id == user_id).cloned().collect())
    }

    async fn find_by_period(&self, period: &str) -> StoreResult<Vec<UsageTracking>> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().filter(|row| row.period == period).cloned().collect())
    }

    async fn start_fresh(&self, user_id: &ObjectId, period: &str, now: DateTime) -> StoreResult<UsageTracking> {
        let mut rows = lock(&self.rows)?;

        for row in rows.iter_mut().filter(|row| is_current_for(row, user_id, period)) {
            row.is_current = false;
            row.superseded_at = Some(now);
            row.updated_at = now;
        }

        let mut record = UsageTracking::empty(*user_id, period.to_string(), now);
        record.id = Some(ObjectId::new());
        record.is_reset = true;
        rows.push(record.clone());
        Ok(record)
    }
}
