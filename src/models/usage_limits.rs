use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;
use validator::Validate;

use crate::models::{LimitValue, UsageCategory};
use crate::services::period::to_rfc3339;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct AiUsageLimits {
    #[serde(default)]
    pub independent_agent: LimitValue,
    #[serde(default)]
    pub lumen_agent: LimitValue,
    #[serde(default)]
    pub rag_agent: LimitValue,
    #[serde(default)]
    pub rag_document_uploads: LimitValue,
}

/// Entitlements of one plan. Missing fields default to `Fixed(0)`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct PlanLimits {
    #[serde(default)]
    pub teachers: LimitValue,
    #[serde(default)]
    pub classrooms: LimitValue,
    #[serde(default)]
    pub students_per_classroom: LimitValue,
    #[serde(default)]
    pub question_banks: LimitValue,
    #[serde(default)]
    pub questions: LimitValue,
    #[serde(default)]
    pub assignment_exports_per_day: LimitValue,
    #[serde(default)]
    pub ai_usage: AiUsageLimits,
}

impl PlanLimits {
    pub fn limit_for(&self, category: UsageCategory) -> LimitValue {
        match category {
            UsageCategory::Teachers => self.teachers,
            UsageCategory::Classrooms => self.classrooms,
            UsageCategory::StudentsPerClassroom => self.students_per_classroom,
            UsageCategory::QuestionBanks => self.question_banks,
            UsageCategory::Questions => self.questions,
            UsageCategory::AssignmentExports => self.assignment_exports_per_day,
            UsageCategory::IndependentAgent => self.ai_usage.independent_agent,
            UsageCategory::LumenAgent => self.ai_usage.lumen_agent,
            UsageCategory::RagAgent => self.ai_usage.rag_agent,
            UsageCategory::RagDocumentUploads => self.ai_usage.rag_document_uploads,
        }
    }

    /// Same value for every category; used for unentitled users.
    pub fn uniform(value: LimitValue) -> Self {
        PlanLimits {
            teachers: value,
            classrooms: value,
            students_per_classroom: value,
            question_banks: value,
            questions: value,
            assignment_exports_per_day: value,
            ai_usage: AiUsageLimits {
                independent_agent: value,
                lumen_agent: value,
                rag_agent: value,
                rag_document_uploads: value,
            },
        }
    }

    pub fn apply(&mut self, patch: &PlanLimitsPatch) {
        if let Some(v) = patch.teachers {
            self.teachers = v;
        }
        if let Some(v) = patch.classrooms {
            self.classrooms = v;
        }
        if let Some(v) = patch.students_per_classroom {
            self.students_per_classroom = v;
        }
        if let Some(v) = patch.question_banks {
            self.question_banks = v;
        }
        if let Some(v) = patch.questions {
            self.questions = v;
        }
        if let Some(v) = patch.assignment_exports_per_day {
            self.assignment_exports_per_day = v;
        }

        if let Some(ai) = &patch.ai_usage {
            if let Some(v) = ai.independent_agent {
                self.ai_usage.independent_agent = v;
            }
            if let Some(v) = ai.lumen_agent {
                self.ai_usage.lumen_agent = v;
            }
            if let Some(v) = ai.rag_agent {
                self.ai_usage.rag_agent = v;
            }
            if let Some(v) = ai.rag_document_uploads {
                self.ai_usage.rag_document_uploads = v;
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UsageLimits {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub plan_name: String, // "free", "basic", "premium", "enterprise", ...
    pub is_active: bool,
    pub limits: PlanLimits,
    // bumped on every write, checked by conditional replaces
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

// Patch bodies reject unknown field names instead of silently dropping them.

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AiUsageLimitsPatch {
    pub independent_agent: Option<LimitValue>,
    pub lumen_agent: Option<LimitValue>,
    pub rag_agent: Option<LimitValue>,
    pub rag_document_uploads: Option<LimitValue>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PlanLimitsPatch {
    pub teachers: Option<LimitValue>,
    pub classrooms: Option<LimitValue>,
    pub students_per_classroom: Option<LimitValue>,
    pub question_banks: Option<LimitValue>,
    pub questions: Option<LimitValue>,
    pub assignment_exports_per_day: Option<LimitValue>,
    pub ai_usage: Option<AiUsageLimitsPatch>,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct CreateUsageLimitsDto {
    #[validate(length(min = 1, max = 64, message = "Plan name must be 1-64 characters"))]
    pub plan_name: String,
    #[serde(default)]
    pub limits: PlanLimits,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateUsageLimitsDto {
    pub limits: PlanLimits,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct UsageLimitsResponse {
    pub id: String,
    pub plan_name: String,
    pub is_active: bool,
    pub limits: PlanLimits,
    pub created_at: String,
    pub updated_at: String,
}

impl From<UsageLimits> for UsageLimitsResponse {
    fn from(plan: UsageLimits) -> Self {
        UsageLimitsResponse {
            id: plan.id.map(|id| id.to_hex()).unwrap_or_default(),
            plan_name: plan.plan_name,
            is_active: plan.is_active,
            limits: plan.limits,
            created_at: to_rfc3339(plan.created_at),
            updated_at: to_rfc3339(plan.updated_at),
        }
    }
}
