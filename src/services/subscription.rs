use log::{info, warn};
use mongodb::bson::{oid::ObjectId, DateTime};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::SubscriptionStore;
use crate::models::{
    Subscription, SubscriptionStats, SubscriptionStatus, SubscriptionUpdate, SweepFailure, SweepReport,
};
use crate::services::catalog::{normalize_plan_name, UsageLimitsCatalog};
use crate::services::period::{to_bson, to_rfc3339, Clock};
use crate::services::{ServiceError, ServiceResult};

/// Owns subscription records and their lifecycle:
///
/// ```text
/// active ──schedule──▶ scheduled_to_cancel ──reactivate──▶ active
///   │ ▲                      │
///   │ └──────renew───────────┤
///   └──cancel / sweep──▶ cancelled ◀──cancel / sweep──┘
/// ```
///
/// Every write is a conditional replace on the stored `status` and `version`,
/// so two racing transitions on one record cannot both apply.
#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn SubscriptionStore>,
    catalog: UsageLimitsCatalog,
    clock: Arc<dyn Clock>,
}

/// Picks "the" subscription among a user's rows: the single active one, else
/// the most recently updated (ties broken by id).
pub fn select_subscription(rows: &[Subscription]) -> Option<&Subscription> {
    let active: Vec<&Subscription> = rows
        .iter()
        .filter(|sub| sub.status == SubscriptionStatus::Active)
        .collect();

    if active.len() == 1 {
        return Some(active[0]);
    }

    let candidates = if active.is_empty() { rows.iter().collect() } else { active };
    candidates
        .into_iter()
        .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
}

/// Whether the sweep should cancel `sub` at `now`.
pub fn is_expired(sub: &Subscription, now: DateTime) -> bool {
    match sub.status {
        SubscriptionStatus::ScheduledToCancel => sub.cancel_at.is_some_and(|at| now >= at),
        SubscriptionStatus::Active => now >= sub.current_period_end,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Inactive => false,
    }
}

fn validate_period(start: DateTime, end: DateTime) -> ServiceResult<()> {
    if end <= start {
        return Err(ServiceError::validation(format!(
            "Period end ({}) must be after period start ({})",
            to_rfc3339(end),
            to_rfc3339(start)
        )));
    }
    Ok(())
}

fn id_of(sub: &Subscription) -> String {
    sub.id.map(|id| id.to_hex()).unwrap_or_default()
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn SubscriptionStore>, catalog: UsageLimitsCatalog, clock: Arc<dyn Clock>) -> Self {
        SubscriptionManager { store, catalog, clock }
    }

    async fn require_plan(&self, plan_name: &str) -> ServiceResult<String> {
        let plan_name = normalize_plan_name(plan_name)?;
        match self.catalog.get_active_plan(&plan_name).await? {
            Some(_) => Ok(plan_name),
            None => Err(ServiceError::PlanNotFound(plan_name)),
        }
    }

    pub async fn create_subscription(
        &self,
        user_id: ObjectId,
        plan_name: &str,
        period_start: DateTime,
        period_end: DateTime,
    ) -> ServiceResult<Subscription> {
        validate_period(period_start, period_end)?;
        let plan_name = self.require_plan(plan_name).await?;

        let existing = self.store.find_by_user(&user_id).await?;
        if existing.iter().any(|sub| sub.status.is_entitled()) {
            return Err(ServiceError::conflict("User already has an active subscription"));
        }

        let now = self.clock.now();
        let subscription = self
            .store
            .insert(Subscription {
                id: None,
                user_id,
                plan_name,
                status: SubscriptionStatus::Active,
                current_period_start: period_start,
                current_period_end: period_end,
                cancel_at: None,
                cancelled_at: None,
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(
            "Created subscription {} for user {} on plan '{}'",
            id_of(&subscription),
            user_id.to_hex(),
            subscription.plan_name
        );
        Ok(subscription)
    }

    pub async fn get_subscription(&self, id: &ObjectId) -> ServiceResult<Subscription> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Subscription not found"))
    }

    /// Writes `next` if the stored record still matches `current`.
    async fn commit(&self, current: &Subscription, mut next: Subscription) -> ServiceResult<Subscription> {
        next.version = current.version + 1;
        next.updated_at = self.clock.now();

        match self.store.replace_if_unchanged(current, &next).await? {
            Some(saved) => Ok(saved),
            None => {
                warn!("Subscription {} changed concurrently", id_of(current));
                Err(ServiceError::conflict(format!(
                    "Subscription {} was modified concurrently",
                    id_of(current)
                )))
            }
        }
    }

    /// Field-level overwrite of plan and period; never touches `status`.
    pub async fn update_subscription(&self, id: &ObjectId, update: SubscriptionUpdate) -> ServiceResult<Subscription> {
        if update.plan_name.is_none() && update.current_period_start.is_none() && update.current_period_end.is_none() {
            return Err(ServiceError::validation("No fields to update"));
        }

        let current = self.get_subscription(id).await?;
        let mut next = current.clone();

        if let Some(plan_name) = &update.plan_name {
            next.plan_name = self.require_plan(plan_name).await?;
        }
        if let Some(start) = update.current_period_start {
            next.current_period_start = to_bson(start);
        }
        if let Some(end) = update.current_period_end {
            next.current_period_end = to_bson(end);
        }
        validate_period(next.current_period_start, next.current_period_end)?;

        // a pending cancellation follows the period it was scheduled for
        if next.status == SubscriptionStatus::ScheduledToCancel {
            next.cancel_at = Some(next.current_period_end);
        }

        let saved = self.commit(&current, next).await?;
        info!("Updated subscription {}", id_of(&saved));
        Ok(saved)
    }

    /// Immediate cancellation from any state; cancelling twice is a no-op.
    pub async fn cancel_subscription(&self, id: &ObjectId) -> ServiceResult<Subscription> {
        let current = self.get_subscription(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        let mut next = current.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.cancelled_at = Some(self.clock.now());

        let saved = self.commit(&current, next).await?;
        info!("Cancelled subscription {}", id_of(&saved));
        Ok(saved)
    }

    /// `active → scheduled_to_cancel`, cancelling at the end of the current period.
    pub async fn schedule_subscription_cancellation(&self, id: &ObjectId) -> ServiceResult<Subscription> {
        let current = self.get_subscription(id).await?;
        if current.status != SubscriptionStatus::Active {
            return Err(ServiceError::invalid_transition(format!(
                "Cannot schedule cancellation of a {} subscription",
                current.status
            )));
        }

        let mut next = current.clone();
        next.status = SubscriptionStatus::ScheduledToCancel;
        next.cancel_at = Some(current.current_period_end);

        let saved = self.commit(&current, next).await?;
        info!("Scheduled cancellation of subscription {}", id_of(&saved));
        Ok(saved)
    }

    /// `scheduled_to_cancel → active`.
    pub async fn reactivate_subscription(&self, id: &ObjectId) -> ServiceResult<Subscription> {
        let current = self.get_subscription(id).await?;
        if current.status != SubscriptionStatus::ScheduledToCancel {
            return Err(ServiceError::invalid_transition(format!(
                "Cannot reactivate a {} subscription",
                current.status
            )));
        }

        let mut next = current.clone();
        next.status = SubscriptionStatus::Active;
        next.cancel_at = None;

        let saved = self.commit(&current, next).await?;
        info!("Reactivated subscription {}", id_of(&saved));
        Ok(saved)
    }

    /// Rolls the billing window forward; also un-schedules a pending cancellation.
    pub async fn renew_subscription(&self, id: &ObjectId, new_period_end: DateTime) -> ServiceResult<Subscription> {
        let current = self.get_subscription(id).await?;
        if !current.status.is_entitled() {
            return Err(ServiceError::invalid_transition(format!(
                "Cannot renew a {} subscription",
                current.status
            )));
        }

        let new_start = current.current_period_end;
        validate_period(new_start, new_period_end)?;

        let mut next = current.clone();
        next.status = SubscriptionStatus::Active;
        next.current_period_start = new_start;
        next.current_period_end = new_period_end;
        next.cancel_at = None;

        let saved = self.commit(&current, next).await?;
        info!(
            "Renewed subscription {} until {}",
            id_of(&saved),
            to_rfc3339(saved.current_period_end)
        );
        Ok(saved)
    }

    async fn expire(&self, current: &Subscription, now: DateTime) -> ServiceResult<Subscription> {
        let mut next = current.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.cancelled_at = Some(now);
        self.commit(current, next).await
    }

    /// Cancels every subscription whose scheduled cancellation or period end
    /// has passed. Running it again at the same instant transitions nothing.
    pub async fn process_expired_subscriptions(&self) -> ServiceResult<SweepReport> {
        let now = self.clock.now();
        let candidates = self.store.find_expired(now).await?;
        let mut report = SweepReport::default();

        for candidate in candidates {
            // the store filter is re-checked here so a stale candidate is never cancelled
            if !is_expired(&candidate, now) {
                continue;
            }

            let result = match self.expire(&candidate, now).await {
                Err(e) if e.is_conflict() => self.retry_expire(&candidate, now).await,
                other => other.map(Some),
            };

            match result {
                Ok(Some(cancelled)) => {
                    info!("Sweep cancelled subscription {}", id_of(&cancelled));
                    report.transitioned.push(cancelled);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Sweep skipped subscription {}: {}", id_of(&candidate), e);
                    report.failed.push(SweepFailure {
                        subscription_id: id_of(&candidate),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Second attempt after a conflict: re-read, re-evaluate, re-apply once.
    async fn retry_expire(&self, candidate: &Subscription, now: DateTime) -> ServiceResult<Option<Subscription>> {
        let Some(id) = candidate.id else {
            return Ok(None);
        };
        let Some(fresh) = self.store.find_by_id(&id).await? else {
            return Ok(None);
        };

        if !is_expired(&fresh, now) {
            return Ok(None);
        }
        self.expire(&fresh, now).await.map(Some)
    }

    pub async fn get_all_user_subscriptions(&self, user_id: &ObjectId) -> ServiceResult<Vec<Subscription>> {
        let mut rows = self.store.find_by_user(user_id).await?;
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    pub async fn find_user_subscription(&self, user_id: &ObjectId) -> ServiceResult<Option<Subscription>> {
        let rows = self.store.find_by_user(user_id).await?;
        Ok(select_subscription(&rows).cloned())
    }

    pub async fn get_user_subscription(&self, user_id: &ObjectId) -> ServiceResult<Subscription> {
        self.find_user_subscription(user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Subscription not found"))
    }

    pub async fn is_user_subscribed(&self, user_id: &ObjectId) -> ServiceResult<bool> {
        Ok(self
            .find_user_subscription(user_id)
            .await?
            .is_some_and(|sub| sub.status.is_entitled()))
    }

    pub async fn get_subscriptions_by_status(&self, status: SubscriptionStatus) -> ServiceResult<Vec<Subscription>> {
        Ok(self.store.find_by_status(status).await?)
    }

    pub async fn get_subscription_stats(&self) -> ServiceResult<SubscriptionStats> {
        let mut counts = BTreeMap::new();
        for status in SubscriptionStatus::ALL {
            counts.insert(status, self.store.count_by_status(status).await?);
        }
        let total = counts.values().sum();

        Ok(SubscriptionStats { counts, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemorySubscriptionStore, MemoryUsageLimitsStore};
    use crate::db::{StoreResult, SubscriptionStore};
    use crate::models::PlanLimits;
    use crate::services::period::{utc_datetime, FixedClock};

    fn date(year: i32, month: u32, day: u32) -> DateTime {
        utc_datetime(year, month, day).unwrap()
    }

    async fn setup_with(store: Arc<dyn SubscriptionStore>) -> (SubscriptionManager, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(date(2024, 1, 1)));
        let catalog = UsageLimitsCatalog::new(Arc::new(MemoryUsageLimitsStore::default()), clock.clone());
        catalog.create_usage_limits("basic", PlanLimits::default()).await.unwrap();
        catalog.create_usage_limits("premium", PlanLimits::default()).await.unwrap();

        (SubscriptionManager::new(store, catalog, clock.clone()), clock)
    }

    async fn setup() -> (SubscriptionManager, Arc<FixedClock>) {
        setup_with(Arc::new(MemorySubscriptionStore::default())).await
    }

    async fn january(manager: &SubscriptionManager) -> Subscription {
        manager
            .create_subscription(ObjectId::new(), "basic", date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_validates_period_and_plan() {
        let (manager, _) = setup().await;
        let user = ObjectId::new();

        let err = manager
            .create_subscription(user, "basic", date(2024, 2, 1), date(2024, 2, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let err = manager
            .create_subscription(user, "gold", date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::PlanNotFound("gold".into()));

        let sub = manager
            .create_subscription(user, "Basic", date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan_name, "basic");
    }

    #[tokio::test]
    async fn second_entitled_subscription_is_a_conflict() {
        let (manager, _) = setup().await;
        let sub = january(&manager).await;

        let err = manager
            .create_subscription(sub.user_id, "premium", date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        manager.cancel_subscription(&sub.id.unwrap()).await.unwrap();
        assert!(manager
            .create_subscription(sub.user_id, "premium", date(2024, 1, 5), date(2024, 2, 5))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (manager, _) = setup().await;
        let id = january(&manager).await.id.unwrap();

        let first = manager.cancel_subscription(&id).await.unwrap();
        let second = manager.cancel_subscription(&id).await.unwrap();

        assert_eq!(first.status, SubscriptionStatus::Cancelled);
        assert_eq!(second.status, SubscriptionStatus::Cancelled);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn schedule_then_reactivate_restores_active() {
        let (manager, _) = setup().await;
        let id = january(&manager).await.id.unwrap();

        let scheduled = manager.schedule_subscription_cancellation(&id).await.unwrap();
        assert_eq!(scheduled.status, SubscriptionStatus::ScheduledToCancel);
        assert_eq!(scheduled.cancel_at, Some(date(2024, 2, 1)));

        let reactivated = manager.reactivate_subscription(&id).await.unwrap();
        assert_eq!(reactivated.status, SubscriptionStatus::Active);
        assert_eq!(reactivated.cancel_at, None);
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let (manager, _) = setup().await;
        let id = january(&manager).await.id.unwrap();

        assert_eq!(manager.reactivate_subscription(&id).await.unwrap_err().kind(), "invalid_transition");

        manager.schedule_subscription_cancellation(&id).await.unwrap();
        assert_eq!(
            manager.schedule_subscription_cancellation(&id).await.unwrap_err().kind(),
            "invalid_transition"
        );

        manager.cancel_subscription(&id).await.unwrap();
        for err in [
            manager.reactivate_subscription(&id).await.unwrap_err(),
            manager.schedule_subscription_cancellation(&id).await.unwrap_err(),
            manager.renew_subscription(&id, date(2024, 3, 1)).await.unwrap_err(),
        ] {
            assert_eq!(err.kind(), "invalid_transition");
        }
    }

    #[tokio::test]
    async fn renewal_rolls_period_forward() {
        let (manager, _) = setup().await;
        let id = january(&manager).await.id.unwrap();
        manager.schedule_subscription_cancellation(&id).await.unwrap();

        let renewed = manager.renew_subscription(&id, date(2024, 3, 1)).await.unwrap();

        assert_eq!(renewed.status, SubscriptionStatus::Active);
        assert_eq!(renewed.current_period_start, date(2024, 2, 1));
        assert_eq!(renewed.current_period_end, date(2024, 3, 1));
        assert_eq!(renewed.cancel_at, None);

        let err = manager.renew_subscription(&id, date(2024, 3, 1)).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn update_overwrites_fields_but_not_status() {
        let (manager, _) = setup().await;
        let id = january(&manager).await.id.unwrap();
        manager.schedule_subscription_cancellation(&id).await.unwrap();

        let updated = manager
            .update_subscription(
                &id,
                SubscriptionUpdate {
                    plan_name: Some("premium".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.plan_name, "premium");
        assert_eq!(updated.status, SubscriptionStatus::ScheduledToCancel);

        let bad_period = SubscriptionUpdate {
            current_period_end: Some("2023-12-01T00:00:00Z".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(manager.update_subscription(&id, bad_period).await.unwrap_err().kind(), "validation_error");

        let unknown_plan = SubscriptionUpdate {
            plan_name: Some("gold".into()),
            ..Default::default()
        };
        assert_eq!(manager.update_subscription(&id, unknown_plan).await.unwrap_err().kind(), "plan_not_found");
    }

    #[tokio::test]
    async fn moving_period_end_moves_scheduled_cancellation() {
        let (manager, clock) = setup().await;
        let id = january(&manager).await.id.unwrap();
        manager.schedule_subscription_cancellation(&id).await.unwrap();

        let extended = SubscriptionUpdate {
            current_period_end: Some("2024-03-01T00:00:00Z".parse().unwrap()),
            ..Default::default()
        };
        let updated = manager.update_subscription(&id, extended).await.unwrap();
        assert_eq!(updated.cancel_at, Some(date(2024, 3, 1)));

        clock.set(date(2024, 2, 2));
        assert!(manager.process_expired_subscriptions().await.unwrap().transitioned.is_empty());
        assert!(manager.get_subscription(&id).await.unwrap().status.is_entitled());

        clock.set(date(2024, 3, 1));
        let report = manager.process_expired_subscriptions().await.unwrap();
        assert_eq!(report.transitioned.len(), 1);
        assert_eq!(report.transitioned[0].status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn period_update_leaves_active_subscription_unscheduled() {
        let (manager, _) = setup().await;
        let id = january(&manager).await.id.unwrap();

        let extended = SubscriptionUpdate {
            current_period_end: Some("2024-03-01T00:00:00Z".parse().unwrap()),
            ..Default::default()
        };
        let updated = manager.update_subscription(&id, extended).await.unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.cancel_at, None);
    }

    #[tokio::test]
    async fn sweep_cancels_lapsed_subscription_once() {
        let (manager, clock) = setup().await;
        let id = january(&manager).await.id.unwrap();

        clock.set(date(2024, 2, 2));
        let first = manager.process_expired_subscriptions().await.unwrap();
        assert_eq!(first.transitioned.len(), 1);
        assert_eq!(first.transitioned[0].id, Some(id));
        assert_eq!(first.transitioned[0].status, SubscriptionStatus::Cancelled);

        let second = manager.process_expired_subscriptions().await.unwrap();
        assert!(second.transitioned.is_empty());
        assert!(second.failed.is_empty());
    }

    #[tokio::test]
    async fn sweep_honours_schedules_and_renewals() {
        let (manager, clock) = setup().await;
        let scheduled = january(&manager).await.id.unwrap();
        let renewed = january(&manager).await.id.unwrap();
        let running = manager
            .create_subscription(ObjectId::new(), "basic", date(2024, 1, 15), date(2024, 2, 15))
            .await
            .unwrap()
            .id
            .unwrap();

        manager.schedule_subscription_cancellation(&scheduled).await.unwrap();
        manager.renew_subscription(&renewed, date(2024, 3, 1)).await.unwrap();

        clock.set(date(2024, 1, 31));
        assert!(manager.process_expired_subscriptions().await.unwrap().transitioned.is_empty());

        clock.set(date(2024, 2, 1));
        let report = manager.process_expired_subscriptions().await.unwrap();
        let ids: Vec<_> = report.transitioned.iter().filter_map(|s| s.id).collect();
        assert_eq!(ids, vec![scheduled]);

        assert!(manager.get_subscription(&renewed).await.unwrap().status.is_entitled());
        assert!(manager.get_subscription(&running).await.unwrap().status.is_entitled());
    }

    #[tokio::test]
    async fn scheduled_subscription_stays_entitled_until_sweep() {
        let (manager, clock) = setup().await;
        let sub = january(&manager).await;
        manager.schedule_subscription_cancellation(&sub.id.unwrap()).await.unwrap();

        assert!(manager.is_user_subscribed(&sub.user_id).await.unwrap());

        clock.set(date(2024, 2, 2));
        manager.process_expired_subscriptions().await.unwrap();
        assert!(!manager.is_user_subscribed(&sub.user_id).await.unwrap());
        assert!(!manager.is_user_subscribed(&ObjectId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let (manager, _) = setup().await;
        let stale = january(&manager).await;
        manager.schedule_subscription_cancellation(&stale.id.unwrap()).await.unwrap();

        // a writer still holding the pre-schedule record loses the race
        let mut next = stale.clone();
        next.status = SubscriptionStatus::Cancelled;
        let err = manager.commit(&stale, next).await.unwrap_err();
        assert!(err.is_conflict());
    }

    /// Store whose first conditional replace per record reports a lost race,
    /// after an interfering writer has applied `interfere`.
    struct RacingStore {
        inner: MemorySubscriptionStore,
        interfere: fn(&mut Subscription),
        races_left: std::sync::Mutex<u32>,
    }

    #[rocket::async_trait]
    impl SubscriptionStore for RacingStore {
        async fn insert(&self, subscription: Subscription) -> StoreResult<Subscription> {
            self.inner.insert(subscription).await
        }

        async fn find_by_id(&self, id: &ObjectId) -> StoreResult<Option<Subscription>> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_user(&self, user_id: &ObjectId) -> StoreResult<Vec<Subscription>> {
            self.inner.find_by_user(user_id).await
        }

        async fn find_by_status(&self, status: SubscriptionStatus) -> StoreResult<Vec<Subscription>> {
            self.inner.find_by_status(status).await
        }

        async fn find_expired(&self, now: DateTime) -> StoreResult<Vec<Subscription>> {
            self.inner.find_expired(now).await
        }

        async fn replace_if_unchanged(
            &self,
            expected: &Subscription,
            next: &Subscription,
        ) -> StoreResult<Option<Subscription>> {
            let race = {
                let mut left = self.races_left.lock().unwrap();
                let race = *left > 0 && next.status == SubscriptionStatus::Cancelled;
                if race {
                    *left -= 1;
                }
                race
            };

            if race {
                let mut interfering = expected.clone();
                (self.interfere)(&mut interfering);
                interfering.version = expected.version + 1;
                self.inner.replace_if_unchanged(expected, &interfering).await?;
                return Ok(None);
            }
            self.inner.replace_if_unchanged(expected, next).await
        }

        async fn count_by_status(&self, status: SubscriptionStatus) -> StoreResult<u64> {
            self.inner.count_by_status(status).await
        }
    }

    #[tokio::test]
    async fn sweep_retries_once_after_conflict() {
        let store = Arc::new(RacingStore {
            inner: MemorySubscriptionStore::default(),
            interfere: |sub| sub.plan_name = "premium".into(),
            races_left: std::sync::Mutex::new(1),
        });
        let (manager, clock) = setup_with(store).await;
        january(&manager).await;

        clock.set(date(2024, 2, 2));
        let report = manager.process_expired_subscriptions().await.unwrap();

        assert_eq!(report.transitioned.len(), 1);
        assert_eq!(report.transitioned[0].plan_name, "premium");
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn sweep_skips_record_renewed_during_race() {
        let store = Arc::new(RacingStore {
            inner: MemorySubscriptionStore::default(),
            interfere: |sub| sub.current_period_end = utc_datetime(2024, 3, 1).unwrap(),
            races_left: std::sync::Mutex::new(1),
        });
        let (manager, clock) = setup_with(store).await;
        let id = january(&manager).await.id.unwrap();

        clock.set(date(2024, 2, 2));
        let report = manager.process_expired_subscriptions().await.unwrap();

        assert!(report.transitioned.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(manager.get_subscription(&id).await.unwrap().status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn sweep_reports_record_that_keeps_conflicting() {
        let store = Arc::new(RacingStore {
            inner: MemorySubscriptionStore::default(),
            interfere: |sub| sub.plan_name = "premium".into(),
            races_left: std::sync::Mutex::new(2),
        });
        let (manager, clock) = setup_with(store).await;
        let failing = january(&manager).await.id.unwrap();

        clock.set(date(2024, 2, 2));
        let report = manager.process_expired_subscriptions().await.unwrap();

        assert!(report.transitioned.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].subscription_id, failing.to_hex());
    }

    async fn imported_inactive(store: &MemorySubscriptionStore, user_id: ObjectId) -> Subscription {
        let mut sub = row(SubscriptionStatus::Inactive, 0);
        sub.user_id = user_id;
        sub.current_period_start = date(2024, 1, 1);
        sub.current_period_end = date(2024, 2, 1);
        store.insert(sub).await.unwrap()
    }

    #[tokio::test]
    async fn inactive_subscription_only_cancels() {
        let store = Arc::new(MemorySubscriptionStore::default());
        let (manager, _) = setup_with(store.clone()).await;
        let id = imported_inactive(&store, ObjectId::new()).await.id.unwrap();

        let schedule = manager.schedule_subscription_cancellation(&id).await.unwrap_err();
        assert_eq!(schedule.kind(), "invalid_transition");
        let reactivate = manager.reactivate_subscription(&id).await.unwrap_err();
        assert_eq!(reactivate.kind(), "invalid_transition");
        let renew = manager.renew_subscription(&id, date(2024, 3, 1)).await.unwrap_err();
        assert_eq!(renew.kind(), "invalid_transition");
        assert_eq!(manager.get_subscription(&id).await.unwrap().status, SubscriptionStatus::Inactive);

        let cancelled = manager.cancel_subscription(&id).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn inactive_subscription_is_not_entitled() {
        let store = Arc::new(MemorySubscriptionStore::default());
        let (manager, clock) = setup_with(store.clone()).await;
        let user = ObjectId::new();
        let id = imported_inactive(&store, user).await.id.unwrap();

        assert!(!manager.is_user_subscribed(&user).await.unwrap());
        assert_eq!(manager.get_user_subscription(&user).await.unwrap().id, Some(id));

        clock.set(date(2024, 2, 2));
        assert!(manager.process_expired_subscriptions().await.unwrap().transitioned.is_empty());

        let fresh = manager
            .create_subscription(user, "basic", date(2024, 2, 1), date(2024, 3, 1))
            .await
            .unwrap();
        assert_eq!(manager.get_user_subscription(&user).await.unwrap().id, fresh.id);
    }

    #[tokio::test]
    async fn stats_count_every_status() {
        let (manager, _) = setup().await;
        january(&manager).await;
        let cancelled = january(&manager).await.id.unwrap();
        manager.cancel_subscription(&cancelled).await.unwrap();

        let stats = manager.get_subscription_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.counts[&SubscriptionStatus::Active], 1);
        assert_eq!(stats.counts[&SubscriptionStatus::Cancelled], 1);
        assert_eq!(stats.counts[&SubscriptionStatus::Inactive], 0);

        let active = manager.get_subscriptions_by_status(SubscriptionStatus::Active).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    fn row(status: SubscriptionStatus, updated_at: i64) -> Subscription {
        Subscription {
            id: Some(ObjectId::new()),
            user_id: ObjectId::new(),
            plan_name: "basic".into(),
            status,
            current_period_start: DateTime::from_millis(0),
            current_period_end: DateTime::from_millis(1),
            cancel_at: None,
            cancelled_at: None,
            version: 0,
            created_at: DateTime::from_millis(0),
            updated_at: DateTime::from_millis(updated_at),
        }
    }

    #[test]
    fn selection_prefers_single_active_row() {
        let rows = vec![
            row(SubscriptionStatus::Cancelled, 50),
            row(SubscriptionStatus::Active, 10),
        ];
        assert_eq!(select_subscription(&rows).unwrap().status, SubscriptionStatus::Active);
    }

    #[test]
    fn selection_falls_back_to_most_recent() {
        let rows = vec![
            row(SubscriptionStatus::Cancelled, 10),
            row(SubscriptionStatus::ScheduledToCancel, 30),
            row(SubscriptionStatus::Inactive, 20),
        ];
        assert_eq!(select_subscription(&rows).unwrap().status, SubscriptionStatus::ScheduledToCancel);
        assert!(select_subscription(&[]).is_none());
    }

    #[test]
    fn selection_among_several_active_rows_is_deterministic() {
        let older = row(SubscriptionStatus::Active, 10);
        let newer = row(SubscriptionStatus::Active, 20);
        let rows = vec![newer.clone(), older.clone()];
        assert_eq!(select_subscription(&rows).unwrap().id, newer.id);
        let reversed = vec![older, newer.clone()];
        assert_eq!(select_subscription(&reversed).unwrap().id, newer.id);
    }
}
