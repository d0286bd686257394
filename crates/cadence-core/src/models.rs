use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Monthly => write!(f, "monthly"),
            Frequency::Yearly => write!(f, "yearly"),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid frequency: {0}")]
pub struct ParseFrequencyError(String);

impl FromStr for Frequency {
    type Err = ParseFrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "yearly" => Ok(Frequency::Yearly),
            _ => Err(ParseFrequencyError(s.to_string())),
        }
    }
}

/// Scope of an edit or cancellation targeting a materialized instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditScope {
    /// Affect only the selected occurrence
    InstanceOnly,
    /// Restructure the series starting from this occurrence
    ThisAndFuture,
    /// Modify every template sharing the series lineage
    EntireSeries,
}

impl std::fmt::Display for EditScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditScope::InstanceOnly => write!(f, "instance"),
            EditScope::ThisAndFuture => write!(f, "future"),
            EditScope::EntireSeries => write!(f, "series"),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid edit scope: {0}")]
pub struct ParseEditScopeError(String);

impl FromStr for EditScope {
    type Err = ParseEditScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instance" | "this" => Ok(EditScope::InstanceOnly),
            "future" | "this_and_future" => Ok(EditScope::ThisAndFuture),
            "series" | "entire" | "all" => Ok(EditScope::EntireSeries),
            _ => Err(ParseEditScopeError(s.to_string())),
        }
    }
}

/// A standalone event, or the head template of a recurring series when
/// `is_series_template` is set. Instances inherit their descriptive fields
/// from the template at read time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventTemplate {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    pub is_series_template: bool,
    pub creator_id: Uuid,
    pub updater_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One version of a series' recurrence pattern.
///
/// `lineage_id` is shared by every rule (and its template) that has ever
/// represented the same conceptual series, across this-and-future splits.
/// `materialized_until` is the watermark: the latest original start time for
/// which an instance row exists.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurrenceRule {
    pub id: Uuid,
    pub template_id: Uuid,
    pub lineage_id: Uuid,
    pub organization_id: Uuid,
    pub frequency: Frequency,
    pub recur_interval: i32,
    /// Raw RFC 5545 expression for patterns beyond frequency + interval,
    /// also used for display.
    pub rrule_text: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub occurrence_count: Option<i32>,
    pub materialized_until: Option<DateTime<Utc>>,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One concrete, dated occurrence materialized from a template + rule.
///
/// `(template_id, sequence)` and `(rule_id, original_starts_at)` are unique;
/// the second invariant is what makes materialization idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventInstance {
    pub id: Uuid,
    pub template_id: Uuid,
    pub rule_id: Uuid,
    pub lineage_id: Uuid,
    pub organization_id: Uuid,
    /// When this occurrence was scheduled by the pattern, before overrides.
    pub original_starts_at: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// 1-based position within the owning rule.
    pub sequence: i32,
    /// Length of the full series when finite, for "5 of 20" display.
    pub total_count: Option<i32>,
    pub is_cancelled: bool,
    pub generated_at: DateTime<Utc>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Per-organization ledger of how far materialization reaches forward and
/// how far history is retained.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationWindow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub hot_window_months: i32,
    pub retention_months: i32,
    pub window_ends_at: DateTime<Utc>,
    pub retention_starts_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_instance_count: i64,
    pub is_enabled: bool,
    pub priority: i32,
    pub max_instances_per_run: i64,
    pub notes: Option<String>,
    pub creator_id: Uuid,
    pub updater_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A dependent record (action item, booking, ...) bound to exactly one of a
/// series template or a concrete instance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstanceReference {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub template_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl InstanceReference {
    pub fn is_series_level(&self) -> bool {
        self.template_id.is_some()
    }
}

// ============================================================================
// Data Transfer Objects
// ============================================================================

/// Recurrence pattern supplied at series creation or carried by a split.
#[derive(Debug, Clone)]
pub struct RecurrenceInput {
    pub frequency: Frequency,
    pub interval: i32,
    pub ends_at: Option<DateTime<Utc>>,
    pub occurrence_count: Option<i32>,
    /// Raw RFC 5545 expression for constraints beyond frequency + interval.
    pub rrule_text: Option<String>,
}

impl RecurrenceInput {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            ends_at: None,
            occurrence_count: None,
            rrule_text: None,
        }
    }
}

/// Data required to create a new recurring series.
#[derive(Debug, Clone)]
pub struct NewSeriesData {
    pub organization_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    pub recurrence: RecurrenceInput,
    pub creator_id: Uuid,
}

/// Field changes for `update_instance`. Unset fields are left untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct EventFieldEdits {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Present only for this-and-future edits that change the pattern itself;
    /// forces a series split.
    pub recurrence: Option<RecurrenceInput>,
    pub actor_id: Uuid,
}

impl EventFieldEdits {
    /// True when no template-level field is being changed.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
            && self.recurrence.is_none()
    }

    pub fn has_timing_change(&self) -> bool {
        self.starts_at.is_some() || self.ends_at.is_some()
    }
}

/// Result of `update_instance`: instance-only edits hand back the occurrence,
/// series-level edits hand back the (possibly new) template.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Instance(EventInstance),
    Template(EventTemplate),
}

/// Selects which slice of a series to list instances for.
#[derive(Debug, Clone, Copy)]
pub enum SeriesSelector {
    /// Instances owned by one template (one branch of a lineage).
    Template(Uuid),
    /// Every instance across all templates sharing a lineage id.
    Lineage(Uuid),
}

/// Data for creating an organization's generation window.
#[derive(Debug, Clone)]
pub struct NewWindowData {
    pub organization_id: Uuid,
    pub hot_window_months: i32,
    pub retention_months: i32,
    pub priority: i32,
    pub max_instances_per_run: i64,
    pub notes: Option<String>,
    pub creator_id: Uuid,
}

impl NewWindowData {
    pub fn with_defaults(organization_id: Uuid, creator_id: Uuid) -> Self {
        Self {
            organization_id,
            hot_window_months: 12,
            retention_months: 12,
            priority: 5,
            max_instances_per_run: 1000,
            notes: None,
            creator_id,
        }
    }
}

/// Operator-facing settings changes for a generation window.
#[derive(Debug, Clone, Default)]
pub struct WindowSettingsUpdate {
    pub hot_window_months: Option<i32>,
    pub retention_months: Option<i32>,
    pub is_enabled: Option<bool>,
    pub priority: Option<i32>,
    pub max_instances_per_run: Option<i64>,
    pub notes: Option<Option<String>>,
    pub actor_id: Uuid,
}

impl WindowSettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.hot_window_months.is_none()
            && self.retention_months.is_none()
            && self.is_enabled.is_none()
            && self.priority.is_none()
            && self.max_instances_per_run.is_none()
            && self.notes.is_none()
    }
}

/// Retention bookkeeping for one organization, for operator inspection.
#[derive(Debug, Clone)]
pub struct CleanupStatus {
    pub organization_id: Uuid,
    pub total_instances: i64,
    pub instances_eligible_for_prune: i64,
    pub retention_cutoff: DateTime<Utc>,
    pub retention_months: i32,
}
