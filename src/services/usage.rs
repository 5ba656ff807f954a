use log::info;
use mongodb::bson::oid::ObjectId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::db::UsageStore;
use crate::models::{AggregatedUsage, PeriodUsageSummary, UsageCategory, UsageTracking};
use crate::services::period::{day_key, parse_period, period_key, Clock};
use crate::services::{ServiceError, ServiceResult};

/// Per-user, per-period consumption counters.
#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
}

pub fn parse_category(raw: &str) -> ServiceResult<UsageCategory> {
    raw.trim().parse().map_err(ServiceError::Validation)
}

/// Resolves raw category names of a bulk request. Two keys naming the
/// same category once trimmed are rejected rather than merged.
pub fn parse_bulk(raw: &BTreeMap<String, i64>) -> ServiceResult<BTreeMap<UsageCategory, i64>> {
    let mut parsed = BTreeMap::new();
    for (name, delta) in raw {
        let category = parse_category(name)?;
        if parsed.insert(category, *delta).is_some() {
            return Err(ServiceError::validation(format!(
                "Usage category '{}' appears more than once",
                category
            )));
        }
    }
    Ok(parsed)
}

fn validate_delta(category: UsageCategory, delta: i64) -> ServiceResult<()> {
    if delta <= 0 {
        return Err(ServiceError::validation(format!(
            "Usage delta for '{}' must be a positive integer, got {}",
            category, delta
        )));
    }
    Ok(())
}

fn sum_into(totals: &mut BTreeMap<String, i64>, record: &UsageTracking) {
    for (name, count) in &record.counters {
        let total = totals.entry(name.clone()).or_insert(0);
        *total = total.saturating_add(*count);
    }
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        UsageTracker { store, clock }
    }

    pub fn current_day(&self) -> String {
        day_key(self.clock.now())
    }

    pub async fn track_usage(
        &self,
        user_id: &ObjectId,
        category: UsageCategory,
        delta: i64,
    ) -> ServiceResult<UsageTracking> {
        validate_delta(category, delta)?;
        self.apply(user_id, &[(category, delta)]).await
    }

    /// Applies every increment in one store update, so readers never see a
    /// partially applied batch.
    pub async fn track_bulk_usage(
        &self,
        user_id: &ObjectId,
        usage: &BTreeMap<UsageCategory, i64>,
    ) -> ServiceResult<UsageTracking> {
        if usage.is_empty() {
            return Err(ServiceError::validation("No usage to track"));
        }
        for (category, delta) in usage {
            validate_delta(*category, *delta)?;
        }

        let increments: Vec<(UsageCategory, i64)> = usage.iter().map(|(c, d)| (*c, *d)).collect();
        self.apply(user_id, &increments).await
    }

    async fn apply(&self, user_id: &ObjectId, increments: &[(UsageCategory, i64)]) -> ServiceResult<UsageTracking> {
        let now = self.clock.now();
        let record = self
            .store
            .increment(user_id, &period_key(now), &day_key(now), increments, now)
            .await?;
        Ok(record)
    }

    /// Current-period record; an unsaved all-zero record when nothing was tracked yet.
    pub async fn get_current_usage(&self, user_id: &ObjectId) -> ServiceResult<UsageTracking> {
        let now = self.clock.now();
        let period = period_key(now);

        Ok(self
            .store
            .find_current(user_id, &period)
            .await?
            .unwrap_or_else(|| UsageTracking::empty(*user_id, period, now)))
    }

    /// The period's current record, else its most recently superseded one.
    pub async fn get_usage_for_period(&self, user_id: &ObjectId, period: &str) -> ServiceResult<UsageTracking> {
        let period = parse_period(period)?;
        let records = self.store.find_for_period(user_id, &period).await?;

        let current = records.iter().find(|record| record.is_current).cloned();
        current
            .or_else(|| records.into_iter().max_by_key(|record| record.superseded_at.unwrap_or(record.updated_at)))
            .ok_or_else(|| ServiceError::not_found(format!("No usage recorded for period {}", period)))
    }

    /// Every record of the user, superseded ones included, oldest period first.
    pub async fn get_usage_history(&self, user_id: &ObjectId) -> ServiceResult<Vec<UsageTracking>> {
        let mut records = self.store.find_by_user(user_id).await?;
        records.sort_by(|a, b| a.period.cmp(&b.period).then(a.created_at.cmp(&b.created_at)));
        Ok(records)
    }

    /// All-time totals, summed over every historical record.
    pub async fn get_aggregated_usage(&self, user_id: &ObjectId) -> ServiceResult<AggregatedUsage> {
        let records = self.store.find_by_user(user_id).await?;

        let mut totals = BTreeMap::new();
        let mut periods = BTreeSet::new();
        for record in &records {
            sum_into(&mut totals, record);
            periods.insert(record.period.clone());
        }

        Ok(AggregatedUsage {
            user_id: user_id.to_hex(),
            totals,
            periods: periods.into_iter().collect(),
            record_count: records.len(),
        })
    }

    /// Starts a fresh current-period record; the old one is kept as history.
    pub async fn reset_usage(&self, user_id: &ObjectId) -> ServiceResult<UsageTracking> {
        let now = self.clock.now();
        let record = self.store.start_fresh(user_id, &period_key(now), now).await?;

        info!("Reset usage for user {} in period {}", user_id.to_hex(), record.period);
        Ok(record)
    }

    /// Totals across all users for one period.
    pub async fn get_usage_summary_by_period(&self, period: &str) -> ServiceResult<PeriodUsageSummary> {
        let period = parse_period(period)?;
        let records = self.store.find_by_period(&period).await?;

        let mut totals = BTreeMap::new();
        let mut users = BTreeSet::new();
        for record in &records {
            sum_into(&mut totals, record);
            users.insert(record.user_id);
        }

        Ok(PeriodUsageSummary {
            period,
            totals,
            user_count: users.len(),
            record_count: records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryUsageStore;
    use crate::services::period::{utc_datetime, FixedClock};

    fn tracker() -> (UsageTracker, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(utc_datetime(2024, 1, 15).unwrap()));
        let tracker = UsageTracker::new(Arc::new(MemoryUsageStore::default()), clock.clone());
        (tracker, clock)
    }

    #[tokio::test]
    async fn increments_accumulate_in_current_period() {
        let (tracker, _) = tracker();
        let user = ObjectId::new();

        tracker.track_usage(&user, UsageCategory::Questions, 2).await.unwrap();
        tracker.track_usage(&user, UsageCategory::Questions, 3).await.unwrap();

        let current = tracker.get_current_usage(&user).await.unwrap();
        assert_eq!(current.period, "2024-01");
        assert_eq!(current.count(UsageCategory::Questions), 5);
    }

    #[tokio::test]
    async fn non_positive_deltas_are_rejected() {
        let (tracker, _) = tracker();
        let user = ObjectId::new();

        for delta in [0, -1] {
            let err = tracker.track_usage(&user, UsageCategory::Questions, delta).await.unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }

        let bulk = BTreeMap::from([(UsageCategory::Questions, 2), (UsageCategory::RagAgent, -1)]);
        assert!(tracker.track_bulk_usage(&user, &bulk).await.is_err());
        // nothing from the rejected batch was applied
        assert_eq!(tracker.get_current_usage(&user).await.unwrap().count(UsageCategory::Questions), 0);
    }

    #[tokio::test]
    async fn bulk_usage_lands_together() {
        let (tracker, _) = tracker();
        let user = ObjectId::new();

        let bulk = BTreeMap::from([(UsageCategory::Questions, 3), (UsageCategory::RagAgent, 2)]);
        let record = tracker.track_bulk_usage(&user, &bulk).await.unwrap();
        assert_eq!(record.count(UsageCategory::Questions), 3);
        assert_eq!(record.count(UsageCategory::RagAgent), 2);

        let current = tracker.get_current_usage(&user).await.unwrap();
        assert_eq!(current, record);
    }

    #[tokio::test]
    async fn current_usage_without_records_is_unsaved_zero() {
        let (tracker, _) = tracker();
        let user = ObjectId::new();

        let current = tracker.get_current_usage(&user).await.unwrap();
        assert!(current.id.is_none());
        assert!(current.counters.is_empty());
        assert!(tracker.get_usage_history(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_month_starts_new_period() {
        let (tracker, clock) = tracker();
        let user = ObjectId::new();

        tracker.track_usage(&user, UsageCategory::Questions, 4).await.unwrap();
        clock.set(utc_datetime(2024, 2, 3).unwrap());
        tracker.track_usage(&user, UsageCategory::Questions, 1).await.unwrap();

        assert_eq!(tracker.get_current_usage(&user).await.unwrap().count(UsageCategory::Questions), 1);
        let january = tracker.get_usage_for_period(&user, "2024-01").await.unwrap();
        assert_eq!(january.count(UsageCategory::Questions), 4);

        let aggregated = tracker.get_aggregated_usage(&user).await.unwrap();
        assert_eq!(aggregated.totals.get("questions"), Some(&5));
        assert_eq!(aggregated.periods, vec!["2024-01".to_string(), "2024-02".to_string()]);
    }

    #[tokio::test]
    async fn missing_period_is_not_found() {
        let (tracker, _) = tracker();
        let err = tracker.get_usage_for_period(&ObjectId::new(), "2023-07").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let err = tracker.get_usage_for_period(&ObjectId::new(), "July").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn reset_preserves_history() {
        let (tracker, clock) = tracker();
        let user = ObjectId::new();

        tracker.track_usage(&user, UsageCategory::LumenAgent, 7).await.unwrap();
        clock.advance_millis(60_000);
        let fresh = tracker.reset_usage(&user).await.unwrap();
        assert!(fresh.is_reset);

        assert_eq!(tracker.get_current_usage(&user).await.unwrap().count(UsageCategory::LumenAgent), 0);

        let history = tracker.get_usage_history(&user).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_current);
        assert_eq!(history[0].count(UsageCategory::LumenAgent), 7);

        // all-time totals still include the superseded record
        let aggregated = tracker.get_aggregated_usage(&user).await.unwrap();
        assert_eq!(aggregated.totals.get("lumen_agent"), Some(&7));
    }

    #[tokio::test]
    async fn summary_spans_users() {
        let (tracker, _) = tracker();
        let (a, b) = (ObjectId::new(), ObjectId::new());

        tracker.track_usage(&a, UsageCategory::Questions, 2).await.unwrap();
        tracker.track_usage(&b, UsageCategory::Questions, 5).await.unwrap();
        tracker.track_usage(&b, UsageCategory::RagAgent, 1).await.unwrap();

        let summary = tracker.get_usage_summary_by_period("2024-01").await.unwrap();
        assert_eq!(summary.user_count, 2);
        assert_eq!(summary.totals.get("questions"), Some(&7));
        assert_eq!(summary.totals.get("rag_agent"), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let (tracker, _) = tracker();
        let user = ObjectId::new();

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.track_usage(&user, UsageCategory::Questions, 1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(tracker.get_current_usage(&user).await.unwrap().count(UsageCategory::Questions), 64);
        assert_eq!(tracker.get_usage_history(&user).await.unwrap().len(), 1);
    }

    #[test]
    fn bulk_names_are_validated() {
        let raw = BTreeMap::from([("questions".to_string(), 1), ("rag_agent".to_string(), 2)]);
        let parsed = parse_bulk(&raw).unwrap();
        assert_eq!(parsed.get(&UsageCategory::RagAgent), Some(&2));

        let raw = BTreeMap::from([("tokens".to_string(), 1)]);
        assert_eq!(parse_bulk(&raw).unwrap_err().kind(), "validation_error");
    }

    #[test]
    fn bulk_keys_naming_one_category_are_rejected() {
        let raw = BTreeMap::from([("questions".to_string(), 1), (" questions".to_string(), 2)]);
        let err = parse_bulk(&raw).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("questions"));
    }

    #[tokio::test]
    async fn overflowing_counter_is_a_validation_error() {
        let (tracker, _) = tracker();
        let (user, other) = (ObjectId::new(), ObjectId::new());

        tracker.track_usage(&user, UsageCategory::Questions, i64::MAX).await.unwrap();
        let err = tracker.track_usage(&user, UsageCategory::Questions, 1).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let current = tracker.get_current_usage(&user).await.unwrap();
        assert_eq!(current.count(UsageCategory::Questions), i64::MAX as u64);
        tracker.track_usage(&other, UsageCategory::Questions, 1).await.unwrap();
    }

    #[tokio::test]
    async fn summary_totals_saturate() {
        let (tracker, _) = tracker();
        let (a, b) = (ObjectId::new(), ObjectId::new());

        tracker.track_usage(&a, UsageCategory::Questions, i64::MAX).await.unwrap();
        tracker.track_usage(&b, UsageCategory::Questions, i64::MAX).await.unwrap();

        let summary = tracker.get_usage_summary_by_period("2024-01").await.unwrap();
        assert_eq!(summary.totals.get("questions"), Some(&i64::MAX));
        let aggregated = tracker.get_aggregated_usage(&a).await.unwrap();
        assert_eq!(aggregated.totals.get("questions"), Some(&i64::MAX));
    }
}
