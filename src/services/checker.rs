use mongodb::bson::oid::ObjectId;

use crate::models::{
    CategoryCompliance, ComplianceReport, ConsumptionDecision, LimitValue, PlanLimits, UsageCategory,
    UsageTracking, UsageWindow,
};
use crate::services::catalog::{normalize_plan_name, UsageLimitsCatalog};
use crate::services::subscription::SubscriptionManager;
use crate::services::usage::UsageTracker;
use crate::services::{ServiceError, ServiceResult};

/// Compares tracked usage with plan limits.
#[derive(Clone)]
pub struct LimitChecker {
    catalog: UsageLimitsCatalog,
    tracker: UsageTracker,
    subscriptions: SubscriptionManager,
}

/// Usage counted against `category`'s limit: today's count for day-windowed
/// categories, the period count otherwise.
fn used_for(usage: &UsageTracking, category: UsageCategory, today: &str) -> u64 {
    match category.window() {
        UsageWindow::Day => usage.daily_count(today, category),
        UsageWindow::Period => usage.count(category),
    }
}

/// Builds the report. Counters without a matching limit are carried in
/// `usage` but never evaluated.
pub fn evaluate(
    user_id: &ObjectId,
    plan_name: &str,
    entitled: bool,
    limits: PlanLimits,
    usage: &UsageTracking,
    today: &str,
) -> ComplianceReport {
    let categories: Vec<CategoryCompliance> = UsageCategory::ALL
        .into_iter()
        .map(|category| {
            let limit = limits.limit_for(category);
            let used = used_for(usage, category, today);
            CategoryCompliance {
                category,
                limit,
                used,
                remaining: limit.remaining(used),
                within_limit: limit.contains(used),
            }
        })
        .collect();

    let exceeded_limits: Vec<UsageCategory> = categories
        .iter()
        .filter(|c| !c.within_limit)
        .map(|c| c.category)
        .collect();
    let custom_limits = categories
        .iter()
        .filter(|c| c.limit.is_custom())
        .map(|c| c.category)
        .collect();

    ComplianceReport {
        user_id: user_id.to_hex(),
        plan_name: plan_name.to_string(),
        period: usage.period.clone(),
        entitled,
        limits,
        usage: usage.counters.clone(),
        categories,
        within_limits: exceeded_limits.is_empty(),
        exceeded_limits,
        custom_limits,
    }
}

impl LimitChecker {
    pub fn new(catalog: UsageLimitsCatalog, tracker: UsageTracker, subscriptions: SubscriptionManager) -> Self {
        LimitChecker { catalog, tracker, subscriptions }
    }

    /// Checks the user's current usage against an active plan.
    pub async fn check_usage_against_limits(&self, user_id: &ObjectId, plan_name: &str) -> ServiceResult<ComplianceReport> {
        let plan_name = normalize_plan_name(plan_name)?;
        let plan = self
            .catalog
            .get_active_plan(&plan_name)
            .await?
            .ok_or_else(|| ServiceError::PlanNotFound(plan_name.clone()))?;

        let usage = self.tracker.get_current_usage(user_id).await?;
        Ok(evaluate(user_id, &plan.plan_name, true, plan.limits, &usage, &self.tracker.current_day()))
    }

    /// Checks the user against the plan of their own subscription. Users
    /// without an entitled subscription get a zero allowance everywhere.
    pub async fn check_user_usage(&self, user_id: &ObjectId) -> ServiceResult<ComplianceReport> {
        let subscription = self.subscriptions.find_user_subscription(user_id).await?;

        match subscription {
            Some(sub) if sub.status.is_entitled() => self.check_usage_against_limits(user_id, &sub.plan_name).await,
            other => {
                let plan_name = other.map(|sub| sub.plan_name).unwrap_or_default();
                let usage = self.tracker.get_current_usage(user_id).await?;
                Ok(evaluate(
                    user_id,
                    &plan_name,
                    false,
                    PlanLimits::uniform(LimitValue::Fixed(0)),
                    &usage,
                    &self.tracker.current_day(),
                ))
            }
        }
    }

    /// Whether `amount` more units of `category` fit the user's entitlement.
    pub async fn can_consume(&self, user_id: &ObjectId, category: UsageCategory, amount: u64) -> ServiceResult<ConsumptionDecision> {
        if amount == 0 {
            return Err(ServiceError::validation("Amount must be a positive integer"));
        }

        let report = self.check_user_usage(user_id).await?;
        let entry = report
            .category(category)
            .ok_or_else(|| ServiceError::validation(format!("Unknown usage category '{}'", category)))?;

        Ok(ConsumptionDecision {
            category,
            amount,
            allowed: report.entitled && entry.limit.allows(entry.used, amount),
            entitled: report.entitled,
            limit: entry.limit,
            used: entry.used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Stores;
    use crate::models::{AiUsageLimits, Subscription, SubscriptionStatus};
    use crate::services::period::{utc_datetime, FixedClock};
    use crate::services::Services;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn services() -> (Services, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(utc_datetime(2024, 1, 10).unwrap()));
        (Services::new(Stores::memory(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn reaching_a_fixed_limit_is_exceeding_it() {
        let (services, _) = services().await;
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits(
                "team",
                PlanLimits {
                    teachers: LimitValue::Fixed(5),
                    ..PlanLimits::uniform(LimitValue::Unlimited)
                },
            )
            .await
            .unwrap();
        services.tracker.track_usage(&user, UsageCategory::Teachers, 5).await.unwrap();

        let report = services.checker.check_usage_against_limits(&user, "team").await.unwrap();

        assert!(!report.within_limits);
        assert_eq!(report.exceeded_limits, vec![UsageCategory::Teachers]);
        assert_eq!(report.category(UsageCategory::Teachers).unwrap().remaining, Some(0));
    }

    #[tokio::test]
    async fn unlimited_category_is_always_within_limits() {
        let (services, _) = services().await;
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits(
                "open",
                PlanLimits {
                    classrooms: LimitValue::Unlimited,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        services.tracker.track_usage(&user, UsageCategory::Classrooms, 1_000_000).await.unwrap();

        let report = services.checker.check_usage_against_limits(&user, "open").await.unwrap();
        let classrooms = report.category(UsageCategory::Classrooms).unwrap();
        assert!(classrooms.within_limit);
        assert_eq!(classrooms.remaining, None);
        assert!(!report.exceeded_limits.contains(&UsageCategory::Classrooms));
    }

    #[tokio::test]
    async fn custom_limits_pass_but_are_flagged() {
        let (services, _) = services().await;
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits(
                "negotiated",
                PlanLimits {
                    ai_usage: AiUsageLimits {
                        rag_agent: LimitValue::Custom,
                        ..PlanLimits::uniform(LimitValue::Unlimited).ai_usage
                    },
                    ..PlanLimits::uniform(LimitValue::Unlimited)
                },
            )
            .await
            .unwrap();
        services.tracker.track_usage(&user, UsageCategory::RagAgent, 40).await.unwrap();

        let report = services.checker.check_usage_against_limits(&user, "negotiated").await.unwrap();
        assert!(report.within_limits);
        assert_eq!(report.custom_limits, vec![UsageCategory::RagAgent]);
    }

    #[tokio::test]
    async fn missing_usage_counts_as_zero() {
        let (services, _) = services().await;
        services
            .catalog
            .create_usage_limits("tiny", PlanLimits::uniform(LimitValue::Fixed(1)))
            .await
            .unwrap();

        let report = services.checker.check_usage_against_limits(&ObjectId::new(), "tiny").await.unwrap();
        assert!(report.within_limits);
        assert!(report.categories.iter().all(|c| c.used == 0));
    }

    #[tokio::test]
    async fn unknown_or_soft_deleted_plan_is_plan_not_found() {
        let (services, _) = services().await;
        let user = ObjectId::new();

        let err = services.checker.check_usage_against_limits(&user, "ghost").await.unwrap_err();
        assert_eq!(err.kind(), "plan_not_found");

        services.catalog.create_usage_limits("legacy", PlanLimits::default()).await.unwrap();
        services.catalog.soft_delete_usage_limits("legacy").await.unwrap();
        let err = services.checker.check_usage_against_limits(&user, "legacy").await.unwrap_err();
        assert_eq!(err, ServiceError::PlanNotFound("legacy".into()));
    }

    #[tokio::test]
    async fn daily_exports_reset_each_day() {
        let (services, clock) = services().await;
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits(
                "daily",
                PlanLimits {
                    assignment_exports_per_day: LimitValue::Fixed(2),
                    ..PlanLimits::uniform(LimitValue::Unlimited)
                },
            )
            .await
            .unwrap();

        services.tracker.track_usage(&user, UsageCategory::AssignmentExports, 2).await.unwrap();
        let report = services.checker.check_usage_against_limits(&user, "daily").await.unwrap();
        assert_eq!(report.exceeded_limits, vec![UsageCategory::AssignmentExports]);

        clock.set(utc_datetime(2024, 1, 11).unwrap());
        let report = services.checker.check_usage_against_limits(&user, "daily").await.unwrap();
        let exports = report.category(UsageCategory::AssignmentExports).unwrap();
        assert!(exports.within_limit);
        assert_eq!(exports.used, 0);
        assert_eq!(report.usage.get("assignment_exports"), Some(&2));
    }

    #[test]
    fn counters_outside_the_schema_are_ignored() {
        let user = ObjectId::new();
        let mut usage = UsageTracking::empty(user, "2024-01".into(), mongodb::bson::DateTime::now());
        usage.counters = BTreeMap::from([("video_minutes".to_string(), 10_000)]);

        let limits = PlanLimits::uniform(LimitValue::Fixed(1));
        let report = evaluate(&user, "tiny", true, limits, &usage, "2024-01-10");
        assert!(report.within_limits);
        assert_eq!(report.usage.get("video_minutes"), Some(&10_000));
    }

    #[tokio::test]
    async fn unentitled_users_get_zero_allowance() {
        let (services, _) = services().await;
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits("open", PlanLimits::uniform(LimitValue::Unlimited))
            .await
            .unwrap();

        let report = services.checker.check_user_usage(&user).await.unwrap();
        assert!(!report.entitled);
        assert!(!report.within_limits);

        let start = utc_datetime(2024, 1, 1).unwrap();
        let end = utc_datetime(2024, 2, 1).unwrap();
        let sub = services.subscriptions.create_subscription(user, "open", start, end).await.unwrap();
        let report = services.checker.check_user_usage(&user).await.unwrap();
        assert!(report.entitled);
        assert!(report.within_limits);

        services.subscriptions.cancel_subscription(&sub.id.unwrap()).await.unwrap();
        let decision = services.checker.can_consume(&user, UsageCategory::Questions, 1).await.unwrap();
        assert!(!decision.entitled);
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn inactive_subscription_grants_nothing() {
        let clock = Arc::new(FixedClock::new(utc_datetime(2024, 1, 10).unwrap()));
        let stores = Stores::memory();
        let subscriptions = stores.subscriptions.clone();
        let services = Services::new(stores, clock);
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits("open", PlanLimits::uniform(LimitValue::Unlimited))
            .await
            .unwrap();

        let now = utc_datetime(2024, 1, 1).unwrap();
        subscriptions
            .insert(Subscription {
                id: None,
                user_id: user,
                plan_name: "open".into(),
                status: SubscriptionStatus::Inactive,
                current_period_start: now,
                current_period_end: utc_datetime(2024, 2, 1).unwrap(),
                cancel_at: None,
                cancelled_at: None,
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let report = services.checker.check_user_usage(&user).await.unwrap();
        assert!(!report.entitled);
        assert!(!report.within_limits);
        assert_eq!(report.plan_name, "open");

        let decision = services.checker.can_consume(&user, UsageCategory::Questions, 1).await.unwrap();
        assert!(!decision.entitled);
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn can_consume_checks_the_whole_amount() {
        let (services, _) = services().await;
        let user = ObjectId::new();
        services
            .catalog
            .create_usage_limits(
                "basic",
                PlanLimits {
                    questions: LimitValue::Fixed(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let start = utc_datetime(2024, 1, 1).unwrap();
        let end = utc_datetime(2024, 2, 1).unwrap();
        services.subscriptions.create_subscription(user, "basic", start, end).await.unwrap();
        services.tracker.track_usage(&user, UsageCategory::Questions, 7).await.unwrap();

        assert!(services.checker.can_consume(&user, UsageCategory::Questions, 3).await.unwrap().allowed);
        assert!(!services.checker.can_consume(&user, UsageCategory::Questions, 4).await.unwrap().allowed);
        assert_eq!(
            services.checker.can_consume(&user, UsageCategory::Questions, 0).await.unwrap_err().kind(),
            "validation_error"
        );
    }
}
