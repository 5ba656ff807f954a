use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::services::period::to_rfc3339;

/// Accounting window a category's limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageWindow {
    Period,
    Day,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageCategory {
    Teachers,
    Classrooms,
    StudentsPerClassroom,
    QuestionBanks,
    Questions,
    AssignmentExports,
    IndependentAgent,
    LumenAgent,
    RagAgent,
    RagDocumentUploads,
}

impl UsageCategory {
    pub const ALL: [UsageCategory; 10] = [
        UsageCategory::Teachers,
        UsageCategory::Classrooms,
        UsageCategory::StudentsPerClassroom,
        UsageCategory::QuestionBanks,
        UsageCategory::Questions,
        UsageCategory::AssignmentExports,
        UsageCategory::IndependentAgent,
        UsageCategory::LumenAgent,
        UsageCategory::RagAgent,
        UsageCategory::RagDocumentUploads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageCategory::Teachers => "teachers",
            UsageCategory::Classrooms => "classrooms",
            UsageCategory::StudentsPerClassroom => "students_per_classroom",
            UsageCategory::QuestionBanks => "question_banks",
            UsageCategory::Questions => "questions",
            UsageCategory::AssignmentExports => "assignment_exports",
            UsageCategory::IndependentAgent => "independent_agent",
            UsageCategory::LumenAgent => "lumen_agent",
            UsageCategory::RagAgent => "rag_agent",
            UsageCategory::RagDocumentUploads => "rag_document_uploads",
        }
    }

    pub fn window(&self) -> UsageWindow {
        match self {
            UsageCategory::AssignmentExports => UsageWindow::Day,
            _ => UsageWindow::Period,
        }
    }
}

impl fmt::Display for UsageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageCategory {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        UsageCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == raw)
            .ok_or_else(|| format!("Unknown usage category '{}'", raw))
    }
}

/// Per-user, per-period consumption counters.
///
/// Counters are kept as an open name→count map: categories written by newer
/// writers are preserved and simply ignored by the limit checker.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UsageTracking {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: ObjectId,
    pub period: String, // "YYYY-MM"
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
    // day key ("YYYY-MM-DD") -> counters for day-windowed categories
    #[serde(default)]
    pub daily_counters: BTreeMap<String, BTreeMap<String, i64>>,
    pub is_current: bool,
    #[serde(default)]
    pub is_reset: bool,
    pub superseded_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl UsageTracking {
    /// Unsaved all-zero record for the given period.
    pub fn empty(user_id: ObjectId, period: String, now: DateTime) -> Self {
        UsageTracking {
            id: None,
            user_id,
            period,
            counters: BTreeMap::new(),
            daily_counters: BTreeMap::new(),
            is_current: true,
            is_reset: false,
            superseded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn count(&self, category: UsageCategory) -> u64 {
        self.counters.get(category.as_str()).copied().unwrap_or(0).max(0) as u64
    }

    pub fn daily_count(&self, day: &str, category: UsageCategory) -> u64 {
        self.daily_counters
            .get(day)
            .and_then(|counters| counters.get(category.as_str()))
            .copied()
            .unwrap_or(0)
            .max(0) as u64
    }

    /// Applies increments in memory; the stores call this under their own lock.
    ///
    /// Either every increment is applied or none is: a counter that would
    /// overflow leaves the record untouched and names the category.
    pub fn apply_increments(&mut self, increments: &[(UsageCategory, i64)], day: &str) -> Result<(), UsageCategory> {
        let mut counters = self.counters.clone();
        let mut daily = self.daily_counters.get(day).cloned().unwrap_or_default();

        for (category, delta) in increments {
            bump(&mut counters, *category, *delta)?;
            if category.window() == UsageWindow::Day {
                bump(&mut daily, *category, *delta)?;
            }
        }

        self.counters = counters;
        if !daily.is_empty() {
            self.daily_counters.insert(day.to_string(), daily);
        }
        Ok(())
    }
}

fn bump(counters: &mut BTreeMap<String, i64>, category: UsageCategory, delta: i64) -> Result<(), UsageCategory> {
    let count = counters.entry(category.as_str().to_string()).or_insert(0);
    *count = count.checked_add(delta).ok_or(category)?;
    Ok(())
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TrackUsageDto {
    pub category: String,
    #[serde(default = "default_delta")]
    pub delta: i64,
}

fn default_delta() -> i64 {
    1
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TrackBulkUsageDto {
    pub usage: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct UsageTrackingResponse {
    pub id: Option<String>,
    pub user_id: String,
    pub period: String,
    pub counters: BTreeMap<String, i64>,
    pub daily_counters: BTreeMap<String, BTreeMap<String, i64>>,
    pub is_current: bool,
    pub is_reset: bool,
    pub superseded_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<UsageTracking> for UsageTrackingResponse {
    fn from(record: UsageTracking) -> Self {
        UsageTrackingResponse {
            id: record.id.map(|id| id.to_hex()),
            user_id: record.user_id.to_hex(),
            period: record.period,
            counters: record.counters,
            daily_counters: record.daily_counters,
            is_current: record.is_current,
            is_reset: record.is_reset,
            superseded_at: record.superseded_at.map(to_rfc3339),
            created_at: to_rfc3339(record.created_at),
            updated_at: to_rfc3339(record.updated_at),
        }
    }
}

/// All-time totals for one user.
#[derive(Debug, Serialize, Clone, PartialEq, JsonSchema)]
pub struct AggregatedUsage {
    pub user_id: String,
    pub totals: BTreeMap<String, i64>,
    pub periods: Vec<String>,
    pub record_count: usize,
}

/// Totals across all users for one period.
#[derive(Debug, Serialize, Clone, PartialEq, JsonSchema)]
pub struct PeriodUsageSummary {
    pub period: String,
    pub totals: BTreeMap<String, i64>,
    pub user_count: usize,
    pub record_count: usize,
}
