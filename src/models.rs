use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// Free-form JSON object attached to experiments, variants and assignments.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Planned,
    Running,
    Paused,
    Completed,
    Disabled,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Planned => "planned",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub default_variant: Option<String>,
    /// Share of users (0 to 100) that participate in the experiment.
    #[serde(default = "default_traffic_percentage")]
    pub traffic_percentage: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

pub(crate) fn default_traffic_percentage() -> f64 {
    100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub experiment_key: String,
    pub variant: String,
    /// Relative weight. Weights are normalized at selection time and need not sum to anything.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

pub(crate) fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailState {
    #[default]
    Active,
    Paused,
    /// The assignment is kept but the user is served as a holdout.
    Disabled,
}

impl GuardrailState {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailState::Active => "active",
            GuardrailState::Paused => "paused",
            GuardrailState::Disabled => "disabled",
        }
    }
}

/// A persisted (experiment, user) assignment. The `variant` never changes once the row exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub experiment_key: String,
    pub user_id: String,
    pub variant: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub guardrail_state: GuardrailState,
    #[serde(default)]
    pub exposures: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub last_exposed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_converted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Row handed to [`AssignmentStore::insert_assignment`](crate::AssignmentStore::insert_assignment).
#[derive(Debug, Clone, PartialEq)]
pub struct NewAssignment {
    pub experiment_key: String,
    pub user_id: String,
    pub variant: String,
    pub assigned_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl NewAssignment {
    /// Materialize the row the way a store does on a successful insert.
    pub(crate) fn into_assignment(self, id: i64) -> Assignment {
        Assignment {
            id,
            experiment_key: self.experiment_key,
            user_id: self.user_id,
            variant: self.variant,
            assigned_at: self.assigned_at,
            guardrail_state: GuardrailState::Active,
            exposures: 0,
            conversions: 0,
            last_exposed_at: None,
            last_converted_at: None,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Assign,
    Expose,
    Convert,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Assign => "assign",
            EventKind::Expose => "expose",
            EventKind::Convert => "convert",
        }
    }

    /// Event name reported to the analytics sink.
    pub fn analytics_event_name(self) -> &'static str {
        match self {
            EventKind::Assign => "experiment_assign",
            EventKind::Expose => "experiment_expose",
            EventKind::Convert => "experiment_convert",
        }
    }
}

/// Append-only audit record of an assign/expose/convert call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_key: String,
    pub user_id: String,
    pub variant: String,
    pub event: EventKind,
    #[serde(default)]
    pub context: Context,
}
