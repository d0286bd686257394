use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::repository::{
    MaterializationRepository, RunSummary, SqliteRepository, WindowRepository,
};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Windows whose end is within this many months are due for work.
    pub look_ahead_months: i32,
    /// Upper bound on organizations picked up per sweep.
    pub max_organizations: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            look_ahead_months: 1,
            max_organizations: 50,
        }
    }
}

/// Aggregate outcome of one `run_all` sweep.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub organizations_processed: usize,
    pub organizations_failed: usize,
    pub instances_created: u64,
    pub instances_pruned: u64,
    pub summaries: Vec<(Uuid, RunSummary)>,
    pub failures: Vec<(Uuid, String)>,
}

/// Drives materialization runs across organizations.
///
/// Organizations progress independently and concurrently, but runs for the
/// same organization serialize on a per-key lock: watermark advancement is
/// not safely interleavable with itself.
#[derive(Clone)]
pub struct MaterializationWorker {
    repository: Arc<SqliteRepository>,
    config: WorkerConfig,
    org_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl MaterializationWorker {
    pub fn new(repository: Arc<SqliteRepository>) -> Self {
        Self::with_config(repository, WorkerConfig::default())
    }

    pub fn with_config(repository: Arc<SqliteRepository>, config: WorkerConfig) -> Self {
        Self {
            repository,
            config,
            org_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, organization_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.org_locks.lock().await;
        locks
            .entry(organization_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs materialization for one organization, holding its lock for the
    /// duration of the run.
    pub async fn run_for_organization(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, EngineError> {
        let lock = self.lock_for(organization_id).await;
        let _guard = lock.lock().await;
        self.repository.run_organization(organization_id, now).await
    }

    /// One sweep over every enabled organization whose window is due,
    /// highest priority first.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Result<WorkerReport, EngineError> {
        let windows = self
            .repository
            .find_windows_needing_work(now, self.config.look_ahead_months, self.config.max_organizations)
            .await?;

        if windows.is_empty() {
            info!("no organizations need materialization work");
            return Ok(WorkerReport::default());
        }

        let mut handles = Vec::with_capacity(windows.len());
        for window in windows {
            let worker = self.clone();
            let organization_id = window.organization_id;
            handles.push((
                organization_id,
                tokio::spawn(async move {
                    worker.run_for_organization(organization_id, now).await
                }),
            ));
        }

        let mut report = WorkerReport::default();
        for (organization_id, handle) in handles {
            match handle.await {
                Ok(Ok(summary)) => {
                    report.organizations_processed += 1;
                    report.instances_created += summary.instances_created;
                    report.instances_pruned += summary.instances_pruned;
                    report.summaries.push((organization_id, summary));
                }
                Ok(Err(e)) => {
                    error!(organization_id = %organization_id, error = %e, "organization run failed");
                    report.organizations_failed += 1;
                    report.failures.push((organization_id, e.to_string()));
                }
                Err(e) => {
                    error!(organization_id = %organization_id, error = %e, "organization run panicked");
                    report.organizations_failed += 1;
                    report.failures.push((organization_id, e.to_string()));
                }
            }
        }

        info!(
            organizations_processed = report.organizations_processed,
            organizations_failed = report.organizations_failed,
            instances_created = report.instances_created,
            instances_pruned = report.instances_pruned,
            "materialization sweep finished"
        );
        Ok(report)
    }
}
