use crate::error::EngineError;
use crate::expander;
use crate::models::{EventTemplate, GenerationWindow, RecurrenceRule};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Statistics for one per-organization materialization run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub rules_processed: usize,
    pub rules_failed: usize,
    pub instances_created: u64,
    pub instances_pruned: u64,
    /// The per-run instance cap stopped the run early; the next run resumes
    /// from the advanced watermarks.
    pub truncated: bool,
    pub errors: Vec<String>,
}

/// End of the hot window: the remainder of the current month plus
/// `hot_window_months` full calendar months stays materialized.
pub fn hot_window_end(now: DateTime<Utc>, hot_window_months: i32) -> DateTime<Utc> {
    let first_of_month = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    first_of_month
        .checked_add_months(Months::new(hot_window_months.max(0) as u32 + 1))
        .unwrap_or(now)
}

/// Instances ending before this are past retention.
pub fn retention_cutoff(now: DateTime<Utc>, retention_months: i32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(retention_months.max(0) as u32))
        .unwrap_or(now)
}

struct RuleRunOutcome {
    created: u64,
    truncated: bool,
}

#[async_trait]
impl super::MaterializationRepository for SqliteRepository {
    async fn run_organization(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, EngineError> {
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

        let mut summary = RunSummary::default();
        if !window.is_enabled {
            debug!(organization_id = %organization_id, "window disabled, skipping run");
            return Ok(summary);
        }

        let target_end = hot_window_end(now, window.hot_window_months);

        let rules: Vec<RecurrenceRule> = sqlx::query_as(
            r#"SELECT * FROM recurrence_rules
            WHERE organization_id = $1
            AND (materialized_until IS NULL OR materialized_until < $2)
            ORDER BY created_at"#,
        )
        .bind(organization_id)
        .bind(target_end)
        .fetch_all(self.pool())
        .await?;

        let budget = window.max_instances_per_run;
        for rule in &rules {
            if summary.instances_created >= budget as u64 {
                summary.truncated = true;
                break;
            }
            let remaining = budget as u64 - summary.instances_created;

            // One rule failing must not sink the rest of the organization.
            match self.materialize_rule(rule, target_end, remaining).await {
                Ok(outcome) => {
                    summary.rules_processed += 1;
                    summary.instances_created += outcome.created;
                    if outcome.truncated {
                        summary.truncated = true;
                    }
                }
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        organization_id = %organization_id,
                        error = %e,
                        "rule expansion failed, skipping"
                    );
                    summary.rules_failed += 1;
                    summary.errors.push(format!("rule {}: {e}", rule.id));
                }
            }
        }

        if !rules.is_empty() && summary.rules_processed == 0 && summary.rules_failed > 0 {
            return Err(EngineError::RunFailed {
                organization_id,
                detail: summary.errors.join("; "),
            });
        }

        summary.instances_pruned = self
            .prune_expired_instances_with_window(&window, now)
            .await?;

        // The ledger end only advances on complete runs, and only forward; a
        // truncated run leaves it behind so discovery picks the organization
        // up again.
        if !summary.truncated {
            sqlx::query(
                r#"UPDATE generation_windows SET window_ends_at = $1, updated_at = $2
                WHERE organization_id = $3 AND window_ends_at < $1"#,
            )
            .bind(target_end)
            .bind(Utc::now())
            .bind(organization_id)
            .execute(self.pool())
            .await?;
        }

        sqlx::query(
            r#"UPDATE generation_windows SET last_run_at = $1, last_run_instance_count = $2
            WHERE organization_id = $3"#,
        )
        .bind(now)
        .bind(summary.instances_created as i64)
        .bind(organization_id)
        .execute(self.pool())
        .await?;

        info!(
            organization_id = %organization_id,
            rules_processed = summary.rules_processed,
            rules_failed = summary.rules_failed,
            instances_created = summary.instances_created,
            instances_pruned = summary.instances_pruned,
            truncated = summary.truncated,
            "materialization run finished"
        );
        Ok(summary)
    }

    async fn prune_expired_instances(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
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
        self.prune_expired_instances_with_window(&window, now).await
    }
}

impl SqliteRepository {
    /// Expands one rule over the gap between its watermark and the hot
    /// window end, upserting at most `budget` new instances.
    async fn materialize_rule(
        &self,
        rule: &RecurrenceRule,
        target_end: DateTime<Utc>,
        budget: u64,
    ) -> Result<RuleRunOutcome, EngineError> {
        let mut tx = self.pool().begin().await?;

        let template: EventTemplate =
            sqlx::query_as("SELECT * FROM event_templates WHERE id = $1")
                .bind(rule.template_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    EngineError::not_found(format!("template {}", rule.template_id))
                })?;

        let duration = template.ends_at - template.starts_at;
        let from = rule.materialized_until.unwrap_or(rule.starts_at);
        let occurrences = expander::occurrences_between(rule, duration, from, target_end)?;
        let total = expander::total_occurrences(rule)?;

        let generated_at = Utc::now();
        let mut created = 0u64;
        let mut truncated = false;
        let mut last_processed: Option<DateTime<Utc>> = None;

        for occurrence in &occurrences {
            if created >= budget {
                truncated = true;
                break;
            }
            if Self::insert_occurrence_in_transaction(&mut tx, rule, occurrence, total, generated_at)
                .await?
            {
                created += 1;
            }
            last_processed = Some(occurrence.original_starts_at);
        }

        if let Some(watermark) = last_processed {
            Self::advance_rule_watermark_in_transaction(&mut tx, rule.id, watermark).await?;
        }

        tx.commit().await?;

        debug!(
            rule_id = %rule.id,
            created,
            truncated,
            watermark = ?last_processed,
            "rule materialized"
        );
        Ok(RuleRunOutcome { created, truncated })
    }

    /// Monotonic: a replayed or reordered run can never move a watermark
    /// backward.
    pub(crate) async fn advance_rule_watermark_in_transaction(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        rule_id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"UPDATE recurrence_rules SET materialized_until = $1, updated_at = $2
            WHERE id = $3 AND (materialized_until IS NULL OR materialized_until < $1)"#,
        )
        .bind(until)
        .bind(Utc::now())
        .bind(rule_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Deletes instances past retention, except those still referenced by a
    /// live dependent record; they stay until the reference clears.
    async fn prune_expired_instances_with_window(
        &self,
        window: &GenerationWindow,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let cutoff = retention_cutoff(now, window.retention_months);

        let result = sqlx::query(
            r#"DELETE FROM event_instances
            WHERE organization_id = $1 AND ends_at < $2
            AND NOT EXISTS (
                SELECT 1 FROM instance_references r WHERE r.instance_id = event_instances.id
            )"#,
        )
        .bind(window.organization_id)
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        let pruned = result.rows_affected();

        sqlx::query(
            "UPDATE generation_windows SET retention_starts_at = $1 WHERE organization_id = $2",
        )
        .bind(cutoff)
        .bind(window.organization_id)
        .execute(self.pool())
        .await?;

        if pruned > 0 {
            info!(
                organization_id = %window.organization_id,
                pruned,
                cutoff = %cutoff,
                "pruned instances past retention"
            );
        }
        Ok(pruned)
    }
}
