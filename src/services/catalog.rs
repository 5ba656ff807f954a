use log::{info, warn};
use mongodb::bson::oid::ObjectId;
use std::sync::Arc;

use crate::db::UsageLimitsStore;
use crate::models::{AiUsageLimits, LimitValue, PlanLimits, PlanLimitsPatch, UsageLimits};
use crate::services::period::Clock;
use crate::services::{ServiceError, ServiceResult};

/// Named plans and their entitlement limits.
#[derive(Clone)]
pub struct UsageLimitsCatalog {
    store: Arc<dyn UsageLimitsStore>,
    clock: Arc<dyn Clock>,
}

/// Trims and lower-cases a plan name, rejecting empty or oversized names.
pub fn normalize_plan_name(raw: &str) -> ServiceResult<String> {
    let name = raw.trim().to_lowercase();

    if name.is_empty() || name.chars().count() > 64 {
        return Err(ServiceError::validation("Plan name must be 1-64 characters"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ServiceError::validation(
            "Plan name may only contain letters, digits, '_' and '-'",
        ));
    }

    Ok(name)
}

fn default_plans() -> Vec<(&'static str, PlanLimits)> {
    use LimitValue::{Custom, Fixed, Unlimited};

    vec![
        (
            "free",
            PlanLimits {
                teachers: Fixed(1),
                classrooms: Fixed(1),
                students_per_classroom: Fixed(30),
                question_banks: Fixed(3),
                questions: Fixed(100),
                assignment_exports_per_day: Fixed(5),
                ai_usage: AiUsageLimits {
                    independent_agent: Fixed(10),
                    lumen_agent: Fixed(10),
                    rag_agent: Fixed(5),
                    rag_document_uploads: Fixed(2),
                },
            },
        ),
        (
            "basic",
            PlanLimits {
                teachers: Fixed(5),
                classrooms: Fixed(10),
                students_per_classroom: Fixed(40),
                question_banks: Fixed(25),
                questions: Fixed(1_000),
                assignment_exports_per_day: Fixed(25),
                ai_usage: AiUsageLimits {
                    independent_agent: Fixed(200),
                    lumen_agent: Fixed(200),
                    rag_agent: Fixed(100),
                    rag_document_uploads: Fixed(20),
                },
            },
        ),
        (
            "premium",
            PlanLimits {
                teachers: Fixed(25),
                classrooms: Unlimited,
                students_per_classroom: Fixed(60),
                question_banks: Unlimited,
                questions: Unlimited,
                assignment_exports_per_day: Fixed(100),
                ai_usage: AiUsageLimits {
                    independent_agent: Fixed(2_000),
                    lumen_agent: Fixed(2_000),
                    rag_agent: Fixed(1_000),
                    rag_document_uploads: Fixed(200),
                },
            },
        ),
        (
            "enterprise",
            PlanLimits {
                teachers: Custom,
                classrooms: Unlimited,
                students_per_classroom: Custom,
                question_banks: Unlimited,
                questions: Unlimited,
                assignment_exports_per_day: Unlimited,
                ai_usage: AiUsageLimits {
                    independent_agent: Custom,
                    lumen_agent: Custom,
                    rag_agent: Custom,
                    rag_document_uploads: Custom,
                },
            },
        ),
    ]
}

impl UsageLimitsCatalog {
    pub fn new(store: Arc<dyn UsageLimitsStore>, clock: Arc<dyn Clock>) -> Self {
        UsageLimitsCatalog { store, clock }
    }

    /// Inserts the built-in plans when the catalog is empty. Returns how many were inserted.
    pub async fn seed_default_plans(&self) -> ServiceResult<usize> {
        if self.store.count().await? > 0 {
            return Ok(0);
        }

        let plans = default_plans();
        let seeded = plans.len();
        for (name, limits) in plans {
            self.create_usage_limits(name, limits).await?;
        }
        Ok(seeded)
    }

    pub async fn create_usage_limits(&self, plan_name: &str, limits: PlanLimits) -> ServiceResult<UsageLimits> {
        let plan_name = normalize_plan_name(plan_name)?;

        if self.get_active_plan(&plan_name).await?.is_some() {
            return Err(ServiceError::conflict(format!("Plan '{}' already exists", plan_name)));
        }

        let now = self.clock.now();
        let plan = self
            .store
            .insert(UsageLimits {
                id: None,
                plan_name,
                is_active: true,
                limits,
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!("Created usage limits for plan '{}'", plan.plan_name);
        Ok(plan)
    }

    pub async fn get_usage_limits_by_id(&self, id: &ObjectId) -> ServiceResult<UsageLimits> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Usage limits not found"))
    }

    /// Active plan with this name, if any.
    pub async fn get_active_plan(&self, plan_name: &str) -> ServiceResult<Option<UsageLimits>> {
        let plan_name = normalize_plan_name(plan_name)?;
        let rows = self.store.find_by_plan_name(&plan_name).await?;
        Ok(rows.into_iter().find(|plan| plan.is_active))
    }

    /// Resolves a plan by name: the active row, else the most recently
    /// updated soft-deleted one (historical lookups).
    pub async fn get_usage_limits_by_plan(&self, plan_name: &str) -> ServiceResult<UsageLimits> {
        let plan_name = normalize_plan_name(plan_name)?;
        let rows = self.store.find_by_plan_name(&plan_name).await?;

        if let Some(active) = rows.iter().find(|plan| plan.is_active) {
            return Ok(active.clone());
        }

        rows.into_iter()
            .max_by_key(|plan| plan.updated_at)
            .ok_or_else(|| ServiceError::not_found(format!("Usage limits for plan '{}' not found", plan_name)))
    }

    pub async fn get_all_usage_limits(&self, include_inactive: bool) -> ServiceResult<Vec<UsageLimits>> {
        let mut plans = self.store.find_all(include_inactive).await?;
        plans.sort_by(|a, b| a.plan_name.cmp(&b.plan_name).then(b.updated_at.cmp(&a.updated_at)));
        Ok(plans)
    }

    async fn require_active(&self, plan_name: &str) -> ServiceResult<UsageLimits> {
        self.get_active_plan(plan_name)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Usage limits for plan '{}' not found", plan_name.trim())))
    }

    /// Writes `next` over `current` unless another writer got there first.
    async fn save(&self, current: &UsageLimits, mut next: UsageLimits) -> ServiceResult<UsageLimits> {
        next.version = current.version + 1;
        next.updated_at = self.clock.now();

        if let Some(saved) = self.store.replace_if_unchanged(current, &next).await? {
            return Ok(saved);
        }

        let Some(id) = current.id else {
            return Err(ServiceError::not_found("Usage limits not found"));
        };
        match self.store.find_by_id(&id).await? {
            Some(_) => {
                warn!("Plan '{}' was modified concurrently", current.plan_name);
                Err(ServiceError::conflict(format!(
                    "Plan '{}' was modified concurrently",
                    current.plan_name
                )))
            }
            None => Err(ServiceError::not_found("Usage limits not found")),
        }
    }

    /// Replaces every limit of an active plan.
    pub async fn update_usage_limits(&self, plan_name: &str, limits: PlanLimits) -> ServiceResult<UsageLimits> {
        let current = self.require_active(plan_name).await?;
        let mut next = current.clone();
        next.limits = limits;

        let plan = self.save(&current, next).await?;
        info!("Updated usage limits for plan '{}'", plan.plan_name);
        Ok(plan)
    }

    /// Applies only the fields present in `patch`.
    pub async fn patch_usage_limits(&self, plan_name: &str, patch: &PlanLimitsPatch) -> ServiceResult<UsageLimits> {
        if patch == &PlanLimitsPatch::default() {
            return Err(ServiceError::validation("No fields to update"));
        }

        let current = self.require_active(plan_name).await?;
        let mut next = current.clone();
        next.limits.apply(patch);

        let plan = self.save(&current, next).await?;
        info!("Patched usage limits for plan '{}'", plan.plan_name);
        Ok(plan)
    }

    /// Marks the active plan inactive; it stays resolvable for history.
    pub async fn soft_delete_usage_limits(&self, plan_name: &str) -> ServiceResult<UsageLimits> {
        let current = self.require_active(plan_name).await?;
        let mut next = current.clone();
        next.is_active = false;

        let plan = self.save(&current, next).await?;
        info!("Soft-deleted plan '{}'", plan.plan_name);
        Ok(plan)
    }

    /// Re-activates the most recent soft-deleted row of a plan.
    pub async fn restore_usage_limits(&self, plan_name: &str) -> ServiceResult<UsageLimits> {
        let name = normalize_plan_name(plan_name)?;
        let rows = self.store.find_by_plan_name(&name).await?;

        if rows.iter().any(|plan| plan.is_active) {
            return Err(ServiceError::conflict(format!("Plan '{}' is already active", name)));
        }

        let current = rows
            .into_iter()
            .max_by_key(|plan| plan.updated_at)
            .ok_or_else(|| ServiceError::not_found(format!("Usage limits for plan '{}' not found", name)))?;
        let mut next = current.clone();
        next.is_active = true;

        let plan = self.save(&current, next).await?;
        info!("Restored plan '{}'", plan.plan_name);
        Ok(plan)
    }

    /// Removes the record permanently.
    pub async fn delete_usage_limits(&self, id: &ObjectId) -> ServiceResult<()> {
        if !self.store.delete(id).await? {
            return Err(ServiceError::not_found("Usage limits not found"));
        }
        info!("Deleted usage limits {}", id.to_hex());
        Ok(())
    }
}
