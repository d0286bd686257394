use crate::error::EngineError;
use crate::expander;
use crate::models::{
    EditScope, EventFieldEdits, EventInstance, EventTemplate, NewSeriesData, NewWindowData,
    RecurrenceInput, RecurrenceRule, UpdateOutcome,
};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::info;
use uuid::Uuid;

#[async_trait]
impl super::SeriesRepository for SqliteRepository {
    async fn create_series(
        &self,
        data: NewSeriesData,
    ) -> Result<(EventTemplate, RecurrenceRule), EngineError> {
        if data.ends_at <= data.starts_at {
            return Err(EngineError::InvalidRule(format!(
                "event end {} must be after start {}",
                data.ends_at, data.starts_at
            )));
        }
        expander::validate_recurrence(&data.recurrence, data.starts_at)?;

        let mut tx = self.pool().begin().await?;

        let template = EventTemplate {
            id: Uuid::now_v7(),
            organization_id: data.organization_id,
            name: data.name,
            description: data.description,
            location: data.location,
            starts_at: data.starts_at,
            ends_at: data.ends_at,
            all_day: data.all_day,
            is_series_template: true,
            creator_id: data.creator_id,
            updater_id: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        Self::insert_template_in_transaction(&mut tx, &template).await?;

        let rule_id = Uuid::now_v7();
        let mut rule = RecurrenceRule {
            id: rule_id,
            template_id: template.id,
            // A fresh series starts its own lineage; splits copy this id.
            lineage_id: rule_id,
            organization_id: data.organization_id,
            frequency: data.recurrence.frequency,
            recur_interval: data.recurrence.interval,
            rrule_text: data.recurrence.rrule_text.clone(),
            starts_at: data.starts_at,
            ends_at: data.recurrence.ends_at,
            occurrence_count: data.recurrence.occurrence_count,
            materialized_until: None,
            creator_id: data.creator_id,
            created_at: Utc::now(),
            updated_at: None,
        };
        Self::insert_rule_in_transaction(&mut tx, &rule).await?;

        // Organizations get a default ledger the first time a series shows
        // up; the window end is seeded at the series start so discovery
        // selects the organization on the next scheduled run.
        Self::initialize_window_in_transaction(
            &mut tx,
            NewWindowData::with_defaults(data.organization_id, data.creator_id),
            data.starts_at,
        )
        .await?;

        // One instance is materialized synchronously for immediate
        // visibility; everything further comes from scheduled runs.
        let duration = data.ends_at - data.starts_at;
        let total = expander::total_occurrences(&rule)?;
        if let Some(first) = expander::first_occurrence(&rule, duration)? {
            Self::insert_occurrence_in_transaction(&mut tx, &rule, &first, total, Utc::now())
                .await?;
            Self::advance_rule_watermark_in_transaction(&mut tx, rule.id, first.original_starts_at)
                .await?;
            rule.materialized_until = Some(first.original_starts_at);
        }

        tx.commit().await?;

        info!(
            template_id = %template.id,
            rule_id = %rule.id,
            organization_id = %data.organization_id,
            "created recurring series"
        );
        Ok((template, rule))
    }

    async fn find_template_by_id(&self, id: Uuid) -> Result<Option<EventTemplate>, EngineError> {
        let template = sqlx::query_as("SELECT * FROM event_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(template)
    }

    async fn find_rule_by_template(
        &self,
        template_id: Uuid,
    ) -> Result<Option<RecurrenceRule>, EngineError> {
        let rule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE template_id = $1")
            .bind(template_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(rule)
    }

    async fn find_lineage_rules(
        &self,
        lineage_id: Uuid,
    ) -> Result<Vec<RecurrenceRule>, EngineError> {
        let rules = sqlx::query_as(
            "SELECT * FROM recurrence_rules WHERE lineage_id = $1 ORDER BY starts_at",
        )
        .bind(lineage_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rules)
    }

    async fn update_instance(
        &self,
        instance_id: Uuid,
        scope: EditScope,
        edits: EventFieldEdits,
    ) -> Result<UpdateOutcome, EngineError> {
        let mut tx = self.pool().begin().await?;

        // Existence and cancellation are re-checked inside the transaction
        // that performs the mutation, closing the lookup/mutation race.
        let instance = Self::find_instance_in_transaction(&mut tx, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {instance_id}")))?;
        if instance.is_cancelled {
            return Err(EngineError::AlreadyCancelled(instance_id));
        }

        let outcome = match scope {
            EditScope::InstanceOnly => {
                Self::apply_instance_only_edit(&mut tx, &instance, &edits).await?
            }
            EditScope::ThisAndFuture => {
                Self::apply_this_and_future_edit(&mut tx, &instance, &edits).await?
            }
            EditScope::EntireSeries => {
                Self::apply_entire_series_edit(&mut tx, &instance, &edits).await?
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn cancel_instances(
        &self,
        instance_id: Uuid,
        scope: EditScope,
        _actor_id: Uuid,
    ) -> Result<u64, EngineError> {
        let mut tx = self.pool().begin().await?;

        let instance = Self::find_instance_in_transaction(&mut tx, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {instance_id}")))?;
        if instance.is_cancelled {
            return Err(EngineError::AlreadyCancelled(instance_id));
        }

        let rule = Self::find_rule_in_transaction(&mut tx, instance.rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("rule {}", instance.rule_id)))?;
        let now = Utc::now();

        let cancelled = match scope {
            EditScope::InstanceOnly => {
                sqlx::query(
                    "UPDATE event_instances SET is_cancelled = 1, last_updated_at = $1 WHERE id = $2",
                )
                .bind(now)
                .bind(instance.id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            EditScope::ThisAndFuture => {
                let anchor = instance.original_starts_at;
                // Close every lineage rule still reaching past the anchor so
                // scheduled runs cannot regenerate what was cancelled.
                sqlx::query(
                    r#"UPDATE recurrence_rules SET ends_at = $1, updated_at = $2
                    WHERE lineage_id = $3 AND (ends_at IS NULL OR ends_at >= $4)"#,
                )
                .bind(anchor - Duration::milliseconds(1))
                .bind(now)
                .bind(rule.lineage_id)
                .bind(anchor)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"UPDATE event_instances SET is_cancelled = 1, last_updated_at = $1
                    WHERE lineage_id = $2 AND original_starts_at >= $3 AND is_cancelled = 0"#,
                )
                .bind(now)
                .bind(rule.lineage_id)
                .bind(anchor)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            EditScope::EntireSeries => {
                let lineage_rules: Vec<RecurrenceRule> = sqlx::query_as(
                    "SELECT * FROM recurrence_rules WHERE lineage_id = $1",
                )
                .bind(rule.lineage_id)
                .fetch_all(&mut *tx)
                .await?;

                // Pin each rule's validity at its watermark: the already
                // materialized (now cancelled) rows stay, nothing new grows.
                for lineage_rule in &lineage_rules {
                    let close_at = lineage_rule
                        .materialized_until
                        .unwrap_or(lineage_rule.starts_at - Duration::milliseconds(1));
                    let close_at = match lineage_rule.ends_at {
                        Some(existing) => existing.min(close_at),
                        None => close_at,
                    };
                    sqlx::query(
                        "UPDATE recurrence_rules SET ends_at = $1, updated_at = $2 WHERE id = $3",
                    )
                    .bind(close_at)
                    .bind(now)
                    .bind(lineage_rule.id)
                    .execute(&mut *tx)
                    .await?;
                }

                sqlx::query(
                    r#"UPDATE event_instances SET is_cancelled = 1, last_updated_at = $1
                    WHERE lineage_id = $2 AND is_cancelled = 0"#,
                )
                .bind(now)
                .bind(rule.lineage_id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
        };

        tx.commit().await?;
        info!(instance_id = %instance_id, scope = %scope, cancelled, "cancelled instances");
        Ok(cancelled)
    }

    async fn delete_series(&self, template_id: Uuid) -> Result<(), EngineError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"DELETE FROM instance_references
            WHERE template_id = $1
            OR instance_id IN (SELECT id FROM event_instances WHERE template_id = $1)"#,
        )
        .bind(template_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM event_instances WHERE template_id = $1")
            .bind(template_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM recurrence_rules WHERE template_id = $1")
            .bind(template_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM event_templates WHERE id = $1")
            .bind(template_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("template {template_id}")));
        }

        tx.commit().await?;
        Ok(())
    }
}

impl SqliteRepository {
    async fn apply_instance_only_edit(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &EventInstance,
        edits: &EventFieldEdits,
    ) -> Result<UpdateOutcome, EngineError> {
        if !edits.has_timing_change() {
            return Err(EngineError::NoFieldsProvided);
        }

        let duration = instance.ends_at - instance.starts_at;
        let starts_at = edits.starts_at.unwrap_or(instance.starts_at);
        let ends_at = match (edits.starts_at, edits.ends_at) {
            (_, Some(ends_at)) => ends_at,
            (Some(new_start), None) => new_start + duration,
            (None, None) => instance.ends_at,
        };
        if ends_at <= starts_at {
            return Err(EngineError::InvalidRule(format!(
                "end time must be after start time: {starts_at}"
            )));
        }

        sqlx::query(
            r#"UPDATE event_instances SET starts_at = $1, ends_at = $2, last_updated_at = $3
            WHERE id = $4"#,
        )
        .bind(starts_at)
        .bind(ends_at)
        .bind(Utc::now())
        .bind(instance.id)
        .execute(&mut **tx)
        .await?;

        let updated = Self::find_instance_in_transaction(tx, instance.id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {}", instance.id)))?;
        Ok(UpdateOutcome::Instance(updated))
    }

    /// A this-and-future edit splits the series only when the recurrence
    /// pattern itself changes; metadata and timing changes apply to the
    /// existing template and its future instances in place.
    async fn apply_this_and_future_edit(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &EventInstance,
        edits: &EventFieldEdits,
    ) -> Result<UpdateOutcome, EngineError> {
        if edits.is_empty() {
            return Err(EngineError::NoFieldsProvided);
        }

        let rule = Self::find_rule_in_transaction(tx, instance.rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("rule {}", instance.rule_id)))?;
        let template = Self::find_template_in_transaction(tx, instance.template_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("template {}", instance.template_id)))?;

        match &edits.recurrence {
            None => Self::shift_future_in_place(tx, instance, &template, edits).await,
            Some(recurrence) => {
                Self::split_series(tx, instance, &rule, &template, edits, recurrence).await
            }
        }
    }

    async fn shift_future_in_place(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &EventInstance,
        template: &EventTemplate,
        edits: &EventFieldEdits,
    ) -> Result<UpdateOutcome, EngineError> {
        let now = Utc::now();

        if edits.has_timing_change() {
            let duration = template.ends_at - template.starts_at;
            let new_start = edits.starts_at.unwrap_or(template.starts_at);
            let new_end = edits.ends_at.unwrap_or(new_start + duration);
            if new_end <= new_start {
                return Err(EngineError::InvalidRule(format!(
                    "end time must be after start time: {new_start}"
                )));
            }
            let start_delta = new_start - template.starts_at;
            let end_delta = new_end - template.ends_at;

            let future: Vec<EventInstance> = sqlx::query_as(
                r#"SELECT * FROM event_instances
                WHERE template_id = $1 AND original_starts_at >= $2"#,
            )
            .bind(instance.template_id)
            .bind(instance.original_starts_at)
            .fetch_all(&mut **tx)
            .await?;

            for shifted in &future {
                sqlx::query(
                    r#"UPDATE event_instances SET starts_at = $1, ends_at = $2, last_updated_at = $3
                    WHERE id = $4"#,
                )
                .bind(shifted.starts_at + start_delta)
                .bind(shifted.ends_at + end_delta)
                .bind(now)
                .bind(shifted.id)
                .execute(&mut **tx)
                .await?;
            }
        } else {
            // Consumers key refreshes off the stamp, so it moves even when
            // only template metadata changed.
            sqlx::query(
                r#"UPDATE event_instances SET last_updated_at = $1
                WHERE template_id = $2 AND original_starts_at >= $3"#,
            )
            .bind(now)
            .bind(instance.template_id)
            .bind(instance.original_starts_at)
            .execute(&mut **tx)
            .await?;
        }

        Self::apply_template_field_edits(tx, template.id, edits, now).await?;

        let updated = Self::find_template_in_transaction(tx, template.id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("template {}", template.id)))?;
        Ok(UpdateOutcome::Template(updated))
    }

    async fn split_series(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &EventInstance,
        rule: &RecurrenceRule,
        template: &EventTemplate,
        edits: &EventFieldEdits,
        recurrence: &RecurrenceInput,
    ) -> Result<UpdateOutcome, EngineError> {
        let anchor = instance.original_starts_at;
        let duration = instance.ends_at - instance.starts_at;
        let new_start = edits.starts_at.unwrap_or(instance.starts_at);
        let new_end = edits.ends_at.unwrap_or(new_start + duration);
        if new_end <= new_start {
            return Err(EngineError::InvalidRule(format!(
                "end time must be after start time: {new_start}"
            )));
        }
        expander::validate_recurrence(recurrence, new_start)?;

        // The old rule keeps the past: its validity ends just before the
        // anchor occurrence. Ending before the rule start is fine, the old
        // branch may simply have nothing left.
        sqlx::query("UPDATE recurrence_rules SET ends_at = $1, updated_at = $2 WHERE id = $3")
            .bind(anchor - Duration::milliseconds(1))
            .bind(Utc::now())
            .bind(rule.id)
            .execute(&mut **tx)
            .await?;

        // Relocate the future under the new rule: the old template's rows
        // from the anchor forward disappear and regenerate under the new
        // branch with sequences counted from its start.
        sqlx::query(
            "DELETE FROM event_instances WHERE template_id = $1 AND original_starts_at >= $2",
        )
        .bind(instance.template_id)
        .bind(anchor)
        .execute(&mut **tx)
        .await?;

        let new_template = EventTemplate {
            id: Uuid::now_v7(),
            organization_id: template.organization_id,
            name: edits.name.clone().unwrap_or_else(|| template.name.clone()),
            description: edits
                .description
                .clone()
                .unwrap_or_else(|| template.description.clone()),
            location: edits
                .location
                .clone()
                .unwrap_or_else(|| template.location.clone()),
            starts_at: new_start,
            ends_at: new_end,
            all_day: template.all_day,
            is_series_template: true,
            creator_id: edits.actor_id,
            updater_id: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        Self::insert_template_in_transaction(tx, &new_template).await?;

        let new_rule = RecurrenceRule {
            id: Uuid::now_v7(),
            template_id: new_template.id,
            // Same lineage: the split branches the series, it does not start
            // a new conceptual one.
            lineage_id: rule.lineage_id,
            organization_id: rule.organization_id,
            frequency: recurrence.frequency,
            recur_interval: recurrence.interval,
            rrule_text: recurrence.rrule_text.clone(),
            starts_at: new_start,
            ends_at: recurrence.ends_at,
            occurrence_count: recurrence.occurrence_count,
            materialized_until: None,
            creator_id: edits.actor_id,
            created_at: Utc::now(),
            updated_at: None,
        };
        Self::insert_rule_in_transaction(tx, &new_rule).await?;

        let total = expander::total_occurrences(&new_rule)?;
        if let Some(first) = expander::first_occurrence(&new_rule, new_end - new_start)? {
            Self::insert_occurrence_in_transaction(tx, &new_rule, &first, total, Utc::now())
                .await?;
            Self::advance_rule_watermark_in_transaction(tx, new_rule.id, first.original_starts_at)
                .await?;
        }

        info!(
            old_rule_id = %rule.id,
            new_rule_id = %new_rule.id,
            lineage_id = %rule.lineage_id,
            anchor = %anchor,
            "split series at occurrence"
        );
        Ok(UpdateOutcome::Template(new_template))
    }

    async fn apply_entire_series_edit(
        tx: &mut Transaction<'_, Sqlite>,
        instance: &EventInstance,
        edits: &EventFieldEdits,
    ) -> Result<UpdateOutcome, EngineError> {
        if edits.recurrence.is_some() {
            return Err(EngineError::InvalidRule(
                "recurrence changes apply to this-and-future, not the entire series".to_string(),
            ));
        }
        if edits.is_empty() {
            return Err(EngineError::NoFieldsProvided);
        }

        let rule = Self::find_rule_in_transaction(tx, instance.rule_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("rule {}", instance.rule_id)))?;

        // Possibly more than one template after earlier splits; the edit
        // lands on all of them or none.
        let lineage_rules: Vec<RecurrenceRule> =
            sqlx::query_as("SELECT * FROM recurrence_rules WHERE lineage_id = $1")
                .bind(rule.lineage_id)
                .fetch_all(&mut **tx)
                .await?;

        let now = Utc::now();
        for lineage_rule in &lineage_rules {
            Self::apply_template_field_edits(tx, lineage_rule.template_id, edits, now).await?;
        }

        // Every instance in the lineage gets a fresh stamp, including rows
        // whose stored fields did not change.
        sqlx::query("UPDATE event_instances SET last_updated_at = $1 WHERE lineage_id = $2")
            .bind(now)
            .bind(rule.lineage_id)
            .execute(&mut **tx)
            .await?;

        let updated = Self::find_template_in_transaction(tx, instance.template_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("template {}", instance.template_id)))?;
        Ok(UpdateOutcome::Template(updated))
    }

    async fn apply_template_field_edits(
        tx: &mut Transaction<'_, Sqlite>,
        template_id: Uuid,
        edits: &EventFieldEdits,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE event_templates SET ");
        let mut separated = qb.separated(", ");
        if let Some(name) = &edits.name {
            separated.push("name = ");
            separated.push_bind_unseparated(name.clone());
        }
        if let Some(description) = &edits.description {
            separated.push("description = ");
            separated.push_bind_unseparated(description.clone());
        }
        if let Some(location) = &edits.location {
            separated.push("location = ");
            separated.push_bind_unseparated(location.clone());
        }
        if let Some(starts_at) = edits.starts_at {
            separated.push("starts_at = ");
            separated.push_bind_unseparated(starts_at);
        }
        if let Some(ends_at) = edits.ends_at {
            separated.push("ends_at = ");
            separated.push_bind_unseparated(ends_at);
        }
        separated.push("updater_id = ");
        separated.push_bind_unseparated(edits.actor_id);
        separated.push("updated_at = ");
        separated.push_bind_unseparated(now);
        qb.push(" WHERE id = ");
        qb.push_bind(template_id);
        qb.build().execute(&mut **tx).await?;
        Ok(())
    }

    pub(crate) async fn insert_template_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        template: &EventTemplate,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"INSERT INTO event_templates
            (id, organization_id, name, description, location, starts_at, ends_at, all_day,
             is_series_template, creator_id, updater_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(template.id)
        .bind(template.organization_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.location)
        .bind(template.starts_at)
        .bind(template.ends_at)
        .bind(template.all_day)
        .bind(template.is_series_template)
        .bind(template.creator_id)
        .bind(template.updater_id)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub(crate) async fn insert_rule_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        rule: &RecurrenceRule,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"INSERT INTO recurrence_rules
            (id, template_id, lineage_id, organization_id, frequency, recur_interval, rrule_text,
             starts_at, ends_at, occurrence_count, materialized_until, creator_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(rule.id)
        .bind(rule.template_id)
        .bind(rule.lineage_id)
        .bind(rule.organization_id)
        .bind(rule.frequency)
        .bind(rule.recur_interval)
        .bind(&rule.rrule_text)
        .bind(rule.starts_at)
        .bind(rule.ends_at)
        .bind(rule.occurrence_count)
        .bind(rule.materialized_until)
        .bind(rule.creator_id)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub(crate) async fn find_rule_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Option<RecurrenceRule>, EngineError> {
        let rule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(rule)
    }

    pub(crate) async fn find_template_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Option<EventTemplate>, EngineError> {
        let template = sqlx::query_as("SELECT * FROM event_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(template)
    }
}
