use crate::db::DbPool;
use crate::error::EngineError;
use crate::models::{
    CleanupStatus, EditScope, EventFieldEdits, EventInstance, EventTemplate, GenerationWindow,
    InstanceReference, NewSeriesData, NewWindowData, RecurrenceRule, SeriesSelector,
    UpdateOutcome, WindowSettingsUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// Re-export domain modules
pub mod instances;
pub mod materialization;
pub mod references;
pub mod series;
pub mod windows;

pub use materialization::RunSummary;

/// Series lifecycle: creation, scoped edits and cancellations, deletion.
/// This is the series branch coordinator of the engine: this-and-future
/// edits split the series into a new template + rule sharing the lineage id,
/// entire-series edits propagate across every template of the lineage.
#[async_trait]
pub trait SeriesRepository {
    async fn create_series(
        &self,
        data: NewSeriesData,
    ) -> Result<(EventTemplate, RecurrenceRule), EngineError>;
    async fn find_template_by_id(&self, id: Uuid) -> Result<Option<EventTemplate>, EngineError>;
    async fn find_rule_by_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<RecurrenceRule>, EngineError>;
    async fn find_lineage_rules(
        &self,
        lineage_id: Uuid,
    ) -> Result<Vec<RecurrenceRule>, EngineError>;
    async fn update_instance(
        &self,
        instance_id: Uuid,
        scope: EditScope,
        edits: EventFieldEdits,
    ) -> Result<UpdateOutcome, EngineError>;
    async fn cancel_instances(
        &self,
        instance_id: Uuid,
        scope: EditScope,
        actor_id: Uuid,
    ) -> Result<u64, EngineError>;
    async fn delete_series(&self, template_id: Uuid) -> Result<(), EngineError>;
}

/// Read access to materialized instances.
#[async_trait]
pub trait InstanceRepository {
    async fn find_instance_by_id(&self, id: Uuid) -> Result<Option<EventInstance>, EngineError>;
    async fn list_instances(
        &self,
        selector: SeriesSelector,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        include_cancelled: bool,
    ) -> Result<Vec<EventInstance>, EngineError>;
}

/// Per-organization window ledger administration.
#[async_trait]
pub trait WindowRepository {
    async fn initialize_window(
        &self,
        data: NewWindowData,
        now: DateTime<Utc>,
    ) -> Result<GenerationWindow, EngineError>;
    async fn find_window(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<GenerationWindow>, EngineError>;
    async fn update_window(
        &self,
        organization_id: Uuid,
        update: WindowSettingsUpdate,
    ) -> Result<GenerationWindow, EngineError>;
    async fn find_windows_needing_work(
        &self,
        now: DateTime<Utc>,
        look_ahead_months: i32,
        limit: i64,
    ) -> Result<Vec<GenerationWindow>, EngineError>;
    async fn cleanup_status(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CleanupStatus, EngineError>;
}

/// Binding of dependent records to a series or one concrete occurrence.
#[async_trait]
pub trait ReferenceRepository {
    async fn bind_reference(
        &self,
        organization_id: Uuid,
        template_id: Uuid,
        instance_id: Option<Uuid>,
    ) -> Result<InstanceReference, EngineError>;
    async fn resolve_reference(
        &self,
        reference_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<EventInstance>, EngineError>;
    async fn unbind_reference(&self, reference_id: Uuid) -> Result<(), EngineError>;
}

/// Batch materialization and retention pruning for one organization.
#[async_trait]
pub trait MaterializationRepository {
    async fn run_organization(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, EngineError>;
    async fn prune_expired_instances(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError>;
}

/// Main repository trait that composes all domain traits
#[async_trait]
pub trait Repository:
    SeriesRepository
    + InstanceRepository
    + WindowRepository
    + ReferenceRepository
    + MaterializationRepository
{
}

/// SQLite implementation of the repository pattern
pub struct SqliteRepository {
    pool: DbPool,
}

impl SqliteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool for internal use across modules
    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl Repository for SqliteRepository {}
