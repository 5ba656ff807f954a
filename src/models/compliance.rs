use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;
use std::collections::BTreeMap;

use crate::models::{LimitValue, PlanLimits, UsageCategory};

#[derive(Debug, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct CategoryCompliance {
    pub category: UsageCategory,
    pub limit: LimitValue,
    pub used: u64,
    pub remaining: Option<u64>,
    pub within_limit: bool,
}

/// Result of comparing a user's usage against a plan.
#[derive(Debug, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ComplianceReport {
    pub user_id: String,
    pub plan_name: String,
    pub period: String,
    pub entitled: bool,
    pub limits: PlanLimits,
    pub usage: BTreeMap<String, i64>,
    pub categories: Vec<CategoryCompliance>,
    pub within_limits: bool,
    pub exceeded_limits: Vec<UsageCategory>,
    pub custom_limits: Vec<UsageCategory>,
}

impl ComplianceReport {
    pub fn category(&self, category: UsageCategory) -> Option<&CategoryCompliance> {
        self.categories.iter().find(|c| c.category == category)
    }
}

#[derive(Debug, FromForm, Deserialize, JsonSchema)]
pub struct CanConsumeQuery {
    pub category: String,
    pub amount: Option<u64>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct ConsumptionDecision {
    pub category: UsageCategory,
    pub amount: u64,
    pub allowed: bool,
    pub entitled: bool,
    pub limit: LimitValue,
    pub used: u64,
}
