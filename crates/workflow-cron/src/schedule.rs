//! Durable schedule record (spec.md §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type ScheduleId = Uuid;

/// A persisted cron schedule pointing at a workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub cron_expr: String,
    pub workflow_path: String,
    #[serde(default)]
    pub input_parameters: HashMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(name: impl Into<String>, cron_expr: impl Into<String>, workflow_path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cron_expr: cron_expr.into(),
            workflow_path: workflow_path.into(),
            input_parameters: HashMap::new(),
            enabled: true,
            created_at: Utc::now(),
            last_run_at: None,
            next_run_at: None,
        }
    }
}

/// Optional filter for `ListSchedules` (spec.md §4.6).
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub enabled_only: bool,
    pub name_contains: Option<String>,
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &Schedule) -> bool {
        if self.enabled_only && !schedule.enabled {
            return false;
        }
        if let Some(needle) = &self.name_contains {
            if !schedule.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
