use crate::error::EngineError;
use crate::expander::Occurrence;
use crate::models::{EventInstance, RecurrenceRule, SeriesSelector};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use uuid::Uuid;

#[async_trait]
impl super::InstanceRepository for SqliteRepository {
    async fn find_instance_by_id(&self, id: Uuid) -> Result<Option<EventInstance>, EngineError> {
        let instance = sqlx::query_as("SELECT * FROM event_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(instance)
    }

    async fn list_instances(
        &self,
        selector: SeriesSelector,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        include_cancelled: bool,
    ) -> Result<Vec<EventInstance>, EngineError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM event_instances WHERE ");
        match selector {
            SeriesSelector::Template(id) => {
                qb.push("template_id = ");
                qb.push_bind(id);
            }
            SeriesSelector::Lineage(id) => {
                qb.push("lineage_id = ");
                qb.push_bind(id);
            }
        }
        qb.push(" AND starts_at >= ");
        qb.push_bind(from);
        qb.push(" AND starts_at <= ");
        qb.push_bind(to);
        if !include_cancelled {
            qb.push(" AND is_cancelled = 0");
        }
        qb.push(" ORDER BY starts_at");

        let instances = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(instances)
    }
}

impl SqliteRepository {
    /// Inserts one expanded occurrence, keyed by (rule id, original start).
    /// Returns whether a row was actually created; an existing row is left
    /// untouched, which is what makes re-running a window a no-op.
    pub(crate) async fn insert_occurrence_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        rule: &RecurrenceRule,
        occurrence: &Occurrence,
        total_count: Option<i32>,
        generated_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"INSERT INTO event_instances
            (id, template_id, rule_id, lineage_id, organization_id, original_starts_at,
             starts_at, ends_at, sequence, total_count, is_cancelled, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11)
            ON CONFLICT (rule_id, original_starts_at) DO NOTHING"#,
        )
        .bind(Uuid::now_v7())
        .bind(rule.template_id)
        .bind(rule.id)
        .bind(rule.lineage_id)
        .bind(rule.organization_id)
        .bind(occurrence.original_starts_at)
        .bind(occurrence.starts_at)
        .bind(occurrence.ends_at)
        .bind(occurrence.sequence)
        .bind(total_count)
        .bind(generated_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn find_instance_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Option<EventInstance>, EngineError> {
        let instance = sqlx::query_as("SELECT * FROM event_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(instance)
    }
}
