use crate::error::EngineError;
use crate::models::{EventInstance, InstanceReference, RecurrenceRule};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
impl super::ReferenceRepository for SqliteRepository {
    async fn bind_reference(
        &self,
        organization_id: Uuid,
        template_id: Uuid,
        instance_id: Option<Uuid>,
    ) -> Result<InstanceReference, EngineError> {
        let mut tx = self.pool().begin().await?;

        let template_exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM event_templates WHERE id = $1 AND organization_id = $2")
                .bind(template_id)
                .bind(organization_id)
                .fetch_optional(&mut *tx)
                .await?;
        if template_exists.is_none() {
            return Err(EngineError::not_found("associated resources not found"));
        }

        let reference = if let Some(instance_id) = instance_id {
            // An occurrence-level binding must target an instance of the
            // series' current lineage, not just any instance row.
            let rule: Option<RecurrenceRule> =
                sqlx::query_as("SELECT * FROM recurrence_rules WHERE template_id = $1")
                    .bind(template_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(rule) = rule else {
                return Err(EngineError::not_found("associated resources not found"));
            };

            let instance: Option<EventInstance> = sqlx::query_as(
                "SELECT * FROM event_instances WHERE id = $1 AND organization_id = $2",
            )
            .bind(instance_id)
            .bind(organization_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(instance) = instance else {
                return Err(EngineError::not_found("associated resources not found"));
            };
            if instance.lineage_id != rule.lineage_id {
                return Err(EngineError::not_found("associated resources not found"));
            }

            InstanceReference {
                id: Uuid::now_v7(),
                organization_id,
                template_id: None,
                instance_id: Some(instance_id),
                created_at: Utc::now(),
            }
        } else {
            InstanceReference {
                id: Uuid::now_v7(),
                organization_id,
                template_id: Some(template_id),
                instance_id: None,
                created_at: Utc::now(),
            }
        };

        sqlx::query(
            r#"INSERT INTO instance_references (id, organization_id, template_id, instance_id, created_at)
            VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(reference.id)
        .bind(reference.organization_id)
        .bind(reference.template_id)
        .bind(reference.instance_id)
        .bind(reference.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reference)
    }

    async fn resolve_reference(
        &self,
        reference_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<EventInstance>, EngineError> {
        let reference: InstanceReference =
            sqlx::query_as("SELECT * FROM instance_references WHERE id = $1")
                .bind(reference_id)
                .fetch_optional(self.pool())
                .await?
                .ok_or_else(|| EngineError::not_found(format!("reference {reference_id}")))?;

        if let Some(instance_id) = reference.instance_id {
            let instance = sqlx::query_as("SELECT * FROM event_instances WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(self.pool())
                .await?;
            return Ok(instance);
        }

        // Series-level binding: resolved at read time against whichever
        // occurrence is in scope, preferring the next upcoming one.
        let Some(template_id) = reference.template_id else {
            return Ok(None);
        };
        let rule: Option<RecurrenceRule> =
            sqlx::query_as("SELECT * FROM recurrence_rules WHERE template_id = $1")
                .bind(template_id)
                .fetch_optional(self.pool())
                .await?;
        let Some(rule) = rule else {
            return Ok(None);
        };

        let upcoming: Option<EventInstance> = sqlx::query_as(
            r#"SELECT * FROM event_instances
            WHERE lineage_id = $1 AND is_cancelled = 0 AND starts_at >= $2
            ORDER BY starts_at ASC LIMIT 1"#,
        )
        .bind(rule.lineage_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        if upcoming.is_some() {
            return Ok(upcoming);
        }

        let most_recent = sqlx::query_as(
            r#"SELECT * FROM event_instances
            WHERE lineage_id = $1 AND is_cancelled = 0 AND starts_at < $2
            ORDER BY starts_at DESC LIMIT 1"#,
        )
        .bind(rule.lineage_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(most_recent)
    }

    async fn unbind_reference(&self, reference_id: Uuid) -> Result<(), EngineError> {
        let result = sqlx::query("DELETE FROM instance_references WHERE id = $1")
            .bind(reference_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("reference {reference_id}")));
        }
        Ok(())
    }
}
