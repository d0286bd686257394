use crate::error::EngineError;
use crate::models::{CleanupStatus, GenerationWindow, NewWindowData, WindowSettingsUpdate};
use crate::repository::materialization::retention_cutoff;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use uuid::Uuid;

fn validate_window_settings(
    hot_window_months: i32,
    retention_months: i32,
    priority: i32,
    max_instances_per_run: i64,
) -> Result<(), EngineError> {
    if hot_window_months < 1 {
        return Err(EngineError::InvalidRule(format!(
            "hot window must cover at least one month, got {hot_window_months}"
        )));
    }
    if retention_months < 1 {
        return Err(EngineError::InvalidRule(format!(
            "retention must cover at least one month, got {retention_months}"
        )));
    }
    if !(1..=10).contains(&priority) {
        return Err(EngineError::InvalidRule(format!(
            "priority must be between 1 and 10, got {priority}"
        )));
    }
    if max_instances_per_run < 1 {
        return Err(EngineError::InvalidRule(format!(
            "per-run instance cap must be positive, got {max_instances_per_run}"
        )));
    }
    Ok(())
}

#[async_trait]
impl super::WindowRepository for SqliteRepository {
    async fn initialize_window(
        &self,
        data: NewWindowData,
        now: DateTime<Utc>,
    ) -> Result<GenerationWindow, EngineError> {
        let mut tx = self.pool().begin().await?;
        let window = Self::initialize_window_in_transaction(&mut tx, data, now).await?;
        tx.commit().await?;
        Ok(window)
    }

    async fn find_window(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<GenerationWindow>, EngineError> {
        let window = sqlx::query_as("SELECT * FROM generation_windows WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(window)
    }

    async fn update_window(
        &self,
        organization_id: Uuid,
        update: WindowSettingsUpdate,
    ) -> Result<GenerationWindow, EngineError> {
        if update.is_empty() {
            return Err(EngineError::NoFieldsProvided);
        }

        let mut tx = self.pool().begin().await?;

        let current: GenerationWindow =
            sqlx::query_as("SELECT * FROM generation_windows WHERE organization_id = $1")
                .bind(organization_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    EngineError::not_found(format!(
                        "generation window for organization {organization_id}"
                    ))
                })?;

        validate_window_settings(
            update.hot_window_months.unwrap_or(current.hot_window_months),
            update.retention_months.unwrap_or(current.retention_months),
            update.priority.unwrap_or(current.priority),
            update
                .max_instances_per_run
                .unwrap_or(current.max_instances_per_run),
        )?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE generation_windows SET ");
        let mut separated = qb.separated(", ");
        if let Some(months) = update.hot_window_months {
            separated.push("hot_window_months = ");
            separated.push_bind_unseparated(months);
        }
        if let Some(months) = update.retention_months {
            separated.push("retention_months = ");
            separated.push_bind_unseparated(months);
        }
        if let Some(enabled) = update.is_enabled {
            separated.push("is_enabled = ");
            separated.push_bind_unseparated(enabled);
        }
        if let Some(priority) = update.priority {
            separated.push("priority = ");
            separated.push_bind_unseparated(priority);
        }
        if let Some(cap) = update.max_instances_per_run {
            separated.push("max_instances_per_run = ");
            separated.push_bind_unseparated(cap);
        }
        if let Some(notes) = &update.notes {
            separated.push("notes = ");
            separated.push_bind_unseparated(notes.clone());
        }
        separated.push("updater_id = ");
        separated.push_bind_unseparated(update.actor_id);
        separated.push("updated_at = ");
        separated.push_bind_unseparated(Utc::now());
        qb.push(" WHERE organization_id = ");
        qb.push_bind(organization_id);
        qb.build().execute(&mut *tx).await?;

        let updated: GenerationWindow =
            sqlx::query_as("SELECT * FROM generation_windows WHERE organization_id = $1")
                .bind(organization_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn find_windows_needing_work(
        &self,
        now: DateTime<Utc>,
        look_ahead_months: i32,
        limit: i64,
    ) -> Result<Vec<GenerationWindow>, EngineError> {
        let look_ahead = now
            .checked_add_months(chrono::Months::new(look_ahead_months.max(0) as u32))
            .unwrap_or(now);

        let windows = sqlx::query_as(
            r#"SELECT * FROM generation_windows
            WHERE is_enabled = 1 AND window_ends_at < $1
            ORDER BY priority DESC, window_ends_at ASC
            LIMIT $2"#,
        )
        .bind(look_ahead)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(windows)
    }

    async fn cleanup_status(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CleanupStatus, EngineError> {
        let window: GenerationWindow =
            sqlx::query_as("SELECT * FROM generation_windows WHERE organization_id = $1")
                .bind(organization_id)
                .fetch_optional(self.pool())
                .await?
                .ok_or_else(|| {
                    EngineError::not_found(format!(
                        "generation window for organization {organization_id}"
                    ))
                })?;

        let cutoff = retention_cutoff(now, window.retention_months);

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM event_instances WHERE organization_id = $1")
                .bind(organization_id)
                .fetch_one(self.pool())
                .await?;

        let (eligible,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM event_instances
            WHERE organization_id = $1 AND ends_at < $2
            AND NOT EXISTS (
                SELECT 1 FROM instance_references r WHERE r.instance_id = event_instances.id
            )"#,
        )
        .bind(organization_id)
        .bind(cutoff)
        .fetch_one(self.pool())
        .await?;

        Ok(CleanupStatus {
            organization_id,
            total_instances: total,
            instances_eligible_for_prune: eligible,
            retention_cutoff: cutoff,
            retention_months: window.retention_months,
        })
    }
}

impl SqliteRepository {
    /// Create-or-return-existing, used both by the admin surface and by
    /// series creation for organizations that have never configured one.
    pub(crate) async fn initialize_window_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        data: NewWindowData,
        now: DateTime<Utc>,
    ) -> Result<GenerationWindow, EngineError> {
        validate_window_settings(
            data.hot_window_months,
            data.retention_months,
            data.priority,
            data.max_instances_per_run,
        )?;

        let existing: Option<GenerationWindow> =
            sqlx::query_as("SELECT * FROM generation_windows WHERE organization_id = $1")
                .bind(data.organization_id)
                .fetch_optional(&mut **tx)
                .await?;
        if let Some(window) = existing {
            return Ok(window);
        }

        let window = GenerationWindow {
            id: Uuid::now_v7(),
            organization_id: data.organization_id,
            hot_window_months: data.hot_window_months,
            retention_months: data.retention_months,
            window_ends_at: now,
            retention_starts_at: None,
            last_run_at: None,
            last_run_instance_count: 0,
            is_enabled: true,
            priority: data.priority,
            max_instances_per_run: data.max_instances_per_run,
            notes: data.notes,
            creator_id: data.creator_id,
            updater_id: None,
            created_at: Utc::now(),
            updated_at: None,
        };

        sqlx::query(
            r#"INSERT INTO generation_windows
            (id, organization_id, hot_window_months, retention_months, window_ends_at,
             retention_starts_at, last_run_at, last_run_instance_count, is_enabled,
             priority, max_instances_per_run, notes, creator_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(window.id)
        .bind(window.organization_id)
        .bind(window.hot_window_months)
        .bind(window.retention_months)
        .bind(window.window_ends_at)
        .bind(window.retention_starts_at)
        .bind(window.last_run_at)
        .bind(window.last_run_instance_count)
        .bind(window.is_enabled)
        .bind(window.priority)
        .bind(window.max_instances_per_run)
        .bind(&window.notes)
        .bind(window.creator_id)
        .bind(window.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(window)
    }
}
