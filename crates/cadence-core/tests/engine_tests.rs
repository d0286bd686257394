use cadence_core::db::establish_connection;
use cadence_core::error::EngineError;
use cadence_core::models::*;
use cadence_core::repository::{
    InstanceRepository, MaterializationRepository, ReferenceRepository, SeriesRepository,
    SqliteRepository, WindowRepository,
};
use cadence_core::worker::MaterializationWorker;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Helper function to create a test database
async fn setup_test_db() -> (SqliteRepository, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = establish_connection(&db_path.to_string_lossy())
        .await
        .expect("Failed to establish test database connection");

    (SqliteRepository::new(pool), temp_dir)
}

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
}

fn monthly_until(ends_at: DateTime<Utc>) -> RecurrenceInput {
    RecurrenceInput {
        frequency: Frequency::Monthly,
        interval: 1,
        ends_at: Some(ends_at),
        occurrence_count: None,
        rrule_text: None,
    }
}

fn series_data(
    organization_id: Uuid,
    name: &str,
    starts_at: DateTime<Utc>,
    recurrence: RecurrenceInput,
) -> NewSeriesData {
    NewSeriesData {
        organization_id,
        name: name.to_string(),
        description: Some(format!("Test series: {name}")),
        location: None,
        starts_at,
        ends_at: starts_at + Duration::hours(1),
        all_day: false,
        recurrence,
        creator_id: Uuid::now_v7(),
    }
}

/// Creates the organization's window before the series does, so tests
/// control the hot/retention settings instead of the defaults.
async fn setup_window(
    repo: &SqliteRepository,
    organization_id: Uuid,
    hot_window_months: i32,
    retention_months: i32,
    max_instances_per_run: i64,
    now: DateTime<Utc>,
) -> GenerationWindow {
    repo.initialize_window(
        NewWindowData {
            organization_id,
            hot_window_months,
            retention_months,
            priority: 5,
            max_instances_per_run,
            notes: None,
            creator_id: Uuid::now_v7(),
        },
        now,
    )
    .await
    .expect("Failed to initialize window")
}

async fn lineage_instances(repo: &SqliteRepository, lineage_id: Uuid) -> Vec<EventInstance> {
    repo.list_instances(
        SeriesSelector::Lineage(lineage_id),
        utc(2000, 1, 1),
        utc(2100, 1, 1),
        true,
    )
    .await
    .expect("Failed to list lineage instances")
}

#[tokio::test]
async fn test_create_series_materializes_first_instance_synchronously() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();

    let (template, rule) = repo
        .create_series(series_data(
            org,
            "Monthly board meeting",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .expect("Failed to create series");

    assert!(template.is_series_template);
    assert_eq!(rule.lineage_id, rule.id);
    assert_eq!(rule.materialized_until, Some(utc(2024, 1, 15)));

    let instances = lineage_instances(&repo, rule.lineage_id).await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].sequence, 1);
    assert_eq!(instances[0].original_starts_at, utc(2024, 1, 15));
    assert_eq!(instances[0].total_count, Some(12));

    // The organization got a default window implicitly.
    let window = repo.find_window(org).await.unwrap();
    assert!(window.is_some());
}

#[tokio::test]
async fn test_create_series_rejects_bad_rules_before_any_mutation() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();

    let mut bad_interval = monthly_until(utc(2024, 12, 15));
    bad_interval.interval = 0;
    let result = repo
        .create_series(series_data(org, "Broken", utc(2024, 1, 15), bad_interval))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidRule(_))));

    // Fail closed: nothing was persisted, not even the window.
    assert!(repo.find_window(org).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concrete_scenario_monthly_two_month_window() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 2, 12, 1000, clock).await;
    let (_template, rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();

    let summary = repo.run_organization(org, clock).await.unwrap();
    assert!(!summary.truncated);
    assert_eq!(summary.rules_failed, 0);

    let instances = lineage_instances(&repo, rule.lineage_id).await;
    let dates: Vec<(i32, DateTime<Utc>)> = instances
        .iter()
        .map(|i| (i.sequence, i.original_starts_at))
        .collect();
    assert_eq!(
        dates,
        vec![
            (1, utc(2024, 1, 15)),
            (2, utc(2024, 2, 15)),
            (3, utc(2024, 3, 15)),
        ]
    );

    let rule = repo
        .find_rule_by_template(rule.template_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rule.materialized_until, Some(utc(2024, 3, 15)));
}

#[tokio::test]
async fn test_materialization_is_idempotent() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (_, rule) = repo
        .create_series(series_data(
            org,
            "Weekly retro",
            utc(2024, 1, 8),
            RecurrenceInput::new(Frequency::Weekly),
        ))
        .await
        .unwrap();

    let first = repo.run_organization(org, clock).await.unwrap();
    assert!(first.instances_created > 0);
    let after_first: Vec<(Uuid, DateTime<Utc>)> = lineage_instances(&repo, rule.lineage_id)
        .await
        .iter()
        .map(|i| (i.id, i.original_starts_at))
        .collect();

    // Re-running the same window is a no-op down to the row ids.
    let second = repo.run_organization(org, clock).await.unwrap();
    assert_eq!(second.instances_created, 0);
    let after_second: Vec<(Uuid, DateTime<Utc>)> = lineage_instances(&repo, rule.lineage_id)
        .await
        .iter()
        .map(|i| (i.id, i.original_starts_at))
        .collect();
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_window_end_is_monotonic_and_converges() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 2, 12, 1000, clock).await;
    repo.create_series(series_data(
        org,
        "Monthly sync",
        utc(2024, 1, 15),
        monthly_until(utc(2024, 12, 15)),
    ))
    .await
    .unwrap();

    repo.run_organization(org, clock).await.unwrap();
    let advanced = repo.find_window(org).await.unwrap().unwrap().window_ends_at;
    assert!(advanced >= clock.checked_add_months(chrono::Months::new(2)).unwrap());

    // A replayed run with an older clock must not move the window backward.
    repo.run_organization(org, utc(2023, 6, 1)).await.unwrap();
    let replayed = repo.find_window(org).await.unwrap().unwrap().window_ends_at;
    assert_eq!(replayed, advanced);

    // A later run converges past the new horizon.
    let later = utc(2024, 6, 1);
    repo.run_organization(org, later).await.unwrap();
    let converged = repo.find_window(org).await.unwrap().unwrap().window_ends_at;
    assert!(converged >= later.checked_add_months(chrono::Months::new(2)).unwrap());
    assert!(converged >= advanced);
}

#[tokio::test]
async fn test_split_preserves_history_and_shares_lineage() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (old_template, old_rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let instances = lineage_instances(&repo, old_rule.lineage_id).await;
    let anchor = instances
        .iter()
        .find(|i| i.original_starts_at == utc(2024, 2, 15))
        .expect("month 2 instance materialized")
        .clone();

    let outcome = repo
        .update_instance(
            anchor.id,
            EditScope::ThisAndFuture,
            EventFieldEdits {
                name: Some("Monthly sync (new cadence)".to_string()),
                recurrence: Some(monthly_until(utc(2024, 12, 15))),
                actor_id: Uuid::now_v7(),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to split series");
    let new_template = match outcome {
        UpdateOutcome::Template(t) => t,
        UpdateOutcome::Instance(_) => panic!("split returns the new template"),
    };
    assert_ne!(new_template.id, old_template.id);

    // The old rule keeps the past: its validity now ends before the anchor.
    let old_rule = repo
        .find_rule_by_template(old_template.id)
        .await
        .unwrap()
        .unwrap();
    assert!(old_rule.ends_at.unwrap() < utc(2024, 2, 15));

    let new_rule = repo
        .find_rule_by_template(new_template.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_rule.lineage_id, old_rule.lineage_id);
    assert_eq!(new_rule.starts_at, utc(2024, 2, 15));

    // Month 1 stays on the old template; the anchor now lives under the new
    // rule with its sequence counted from the new start.
    let old_instances = repo
        .list_instances(
            SeriesSelector::Template(old_template.id),
            utc(2024, 1, 1),
            utc(2025, 1, 1),
            true,
        )
        .await
        .unwrap();
    assert_eq!(old_instances.len(), 1);
    assert_eq!(old_instances[0].original_starts_at, utc(2024, 1, 15));

    let new_instances = repo
        .list_instances(
            SeriesSelector::Template(new_template.id),
            utc(2024, 1, 1),
            utc(2025, 1, 1),
            true,
        )
        .await
        .unwrap();
    assert_eq!(new_instances[0].original_starts_at, utc(2024, 2, 15));
    assert_eq!(new_instances[0].sequence, 1);

    // Future runs keep populating under the new rule only.
    repo.run_organization(org, clock).await.unwrap();
    let all = lineage_instances(&repo, old_rule.lineage_id).await;
    assert!(all
        .iter()
        .filter(|i| i.original_starts_at >= utc(2024, 2, 15))
        .all(|i| i.template_id == new_template.id));
}

#[tokio::test]
async fn test_entire_series_edit_propagates_across_split_lineage() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (old_template, old_rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let anchor = lineage_instances(&repo, old_rule.lineage_id)
        .await
        .into_iter()
        .find(|i| i.original_starts_at == utc(2024, 2, 15))
        .unwrap();
    repo.update_instance(
        anchor.id,
        EditScope::ThisAndFuture,
        EventFieldEdits {
            recurrence: Some(monthly_until(utc(2024, 12, 15))),
            actor_id: Uuid::now_v7(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let rules = repo.find_lineage_rules(old_rule.lineage_id).await.unwrap();
    assert_eq!(rules.len(), 2);

    // Edit through an instance of the NEW branch; both templates must move.
    let target = lineage_instances(&repo, old_rule.lineage_id)
        .await
        .into_iter()
        .find(|i| i.original_starts_at == utc(2024, 3, 15))
        .unwrap();
    repo.update_instance(
        target.id,
        EditScope::EntireSeries,
        EventFieldEdits {
            name: Some("Renamed everywhere".to_string()),
            actor_id: Uuid::now_v7(),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to apply entire-series edit");

    for rule in &rules {
        let template = repo
            .find_template_by_id(rule.template_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(template.name, "Renamed everywhere");
    }

    // Every instance under every lineage template carries a fresh stamp,
    // including rows whose stored fields did not change.
    let all = lineage_instances(&repo, old_rule.lineage_id).await;
    assert!(all.len() >= 3);
    assert!(all.iter().all(|i| i.last_updated_at.is_some()));
    assert_ne!(old_template.id, rules[1].template_id);
}

#[tokio::test]
async fn test_entire_series_edit_rejects_empty_field_set() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();

    let (_, rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    let instance = lineage_instances(&repo, rule.lineage_id).await.remove(0);

    let result = repo
        .update_instance(
            instance.id,
            EditScope::EntireSeries,
            EventFieldEdits {
                actor_id: Uuid::now_v7(),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::NoFieldsProvided)));
}

#[tokio::test]
async fn test_any_edit_on_cancelled_instance_is_rejected_without_mutation() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (template, rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let victim = lineage_instances(&repo, rule.lineage_id).await.remove(0);
    let cancelled = repo
        .cancel_instances(victim.id, EditScope::InstanceOnly, Uuid::now_v7())
        .await
        .unwrap();
    assert_eq!(cancelled, 1);

    for scope in [
        EditScope::InstanceOnly,
        EditScope::ThisAndFuture,
        EditScope::EntireSeries,
    ] {
        let result = repo
            .update_instance(
                victim.id,
                scope,
                EventFieldEdits {
                    name: Some("Should not land".to_string()),
                    starts_at: Some(utc(2024, 6, 1)),
                    actor_id: Uuid::now_v7(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::AlreadyCancelled(_))));
    }

    // Cancelling twice is also rejected.
    let result = repo
        .cancel_instances(victim.id, EditScope::InstanceOnly, Uuid::now_v7())
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyCancelled(_))));

    // Zero mutations landed anywhere in the series.
    let template_after = repo
        .find_template_by_id(template.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(template_after.name, "Monthly sync");
    let untouched = lineage_instances(&repo, rule.lineage_id).await;
    assert!(untouched
        .iter()
        .filter(|i| i.id != victim.id)
        .all(|i| i.last_updated_at.is_none()));
}

#[tokio::test]
async fn test_instance_only_edit_touches_one_row_and_keeps_duration() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (template, rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let target = lineage_instances(&repo, rule.lineage_id)
        .await
        .into_iter()
        .find(|i| i.original_starts_at == utc(2024, 2, 15))
        .unwrap();

    let moved_to = utc(2024, 2, 16);
    let outcome = repo
        .update_instance(
            target.id,
            EditScope::InstanceOnly,
            EventFieldEdits {
                starts_at: Some(moved_to),
                actor_id: Uuid::now_v7(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let updated = match outcome {
        UpdateOutcome::Instance(i) => i,
        UpdateOutcome::Template(_) => panic!("instance-only edit returns the instance"),
    };
    assert_eq!(updated.starts_at, moved_to);
    assert_eq!(updated.ends_at, moved_to + Duration::hours(1));
    // The scheduled slot is remembered for idempotent regeneration.
    assert_eq!(updated.original_starts_at, utc(2024, 2, 15));

    // Template and siblings untouched.
    let template_after = repo
        .find_template_by_id(template.id)
        .await
        .unwrap()
        .unwrap();
    assert!(template_after.updated_at.is_none());
    assert!(lineage_instances(&repo, rule.lineage_id)
        .await
        .iter()
        .filter(|i| i.id != target.id)
        .all(|i| i.last_updated_at.is_none()));

    // A re-run does not resurrect the original slot as a duplicate.
    let summary = repo.run_organization(org, clock).await.unwrap();
    assert_eq!(summary.instances_created, 0);

    // An edit without any timing change is rejected.
    let result = repo
        .update_instance(
            target.id,
            EditScope::InstanceOnly,
            EventFieldEdits {
                actor_id: Uuid::now_v7(),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::NoFieldsProvided)));
}

#[tokio::test]
async fn test_retention_prunes_unreferenced_instances_only() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let created_clock = utc(2023, 1, 1);

    // 3 months of retention; the series lives 13 months in the past.
    setup_window(&repo, org, 2, 3, 1000, created_clock).await;
    let (template, rule) = repo
        .create_series(series_data(
            org,
            "Old series",
            utc(2023, 1, 15),
            monthly_until(utc(2023, 2, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, created_clock).await.unwrap();
    assert_eq!(lineage_instances(&repo, rule.lineage_id).await.len(), 2);

    // Shield the February instance with a live dependent record.
    let shielded = lineage_instances(&repo, rule.lineage_id)
        .await
        .into_iter()
        .find(|i| i.original_starts_at == utc(2023, 2, 15))
        .unwrap();
    let reference = repo
        .bind_reference(org, template.id, Some(shielded.id))
        .await
        .unwrap();

    let now = utc(2024, 2, 15);
    let pruned = repo.prune_expired_instances(org, now).await.unwrap();
    assert_eq!(pruned, 1);

    let remaining = lineage_instances(&repo, rule.lineage_id).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, shielded.id);

    let window = repo.find_window(org).await.unwrap().unwrap();
    assert_eq!(
        window.retention_starts_at,
        now.checked_sub_months(chrono::Months::new(3))
    );

    // Once the reference clears, the next run sweeps the instance too.
    repo.unbind_reference(reference.id).await.unwrap();
    let pruned = repo.prune_expired_instances(org, now).await.unwrap();
    assert_eq!(pruned, 1);
    assert!(lineage_instances(&repo, rule.lineage_id).await.is_empty());
}

#[tokio::test]
async fn test_per_run_cap_truncates_and_resumes_from_watermark() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 1, 12, 2, clock).await;
    let (_, rule) = repo
        .create_series(series_data(
            org,
            "Daily digest",
            utc(2024, 1, 1),
            RecurrenceInput::new(Frequency::Daily),
        ))
        .await
        .unwrap();

    let first = repo.run_organization(org, clock).await.unwrap();
    assert!(first.truncated);
    assert_eq!(first.instances_created, 2);

    // Truncation leaves the ledger behind so discovery picks the
    // organization up again.
    let window = repo.find_window(org).await.unwrap().unwrap();
    assert!(window.window_ends_at < utc(2024, 2, 1));

    let second = repo.run_organization(org, clock).await.unwrap();
    assert_eq!(second.instances_created, 2);

    let instances = lineage_instances(&repo, rule.lineage_id).await;
    let sequences: Vec<i32> = instances.iter().map(|i| i.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_disabled_window_skips_run() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 2, 12, 1000, clock).await;
    let (_, rule) = repo
        .create_series(series_data(
            org,
            "Paused series",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();

    repo.update_window(
        org,
        WindowSettingsUpdate {
            is_enabled: Some(false),
            actor_id: Uuid::now_v7(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let summary = repo.run_organization(org, clock).await.unwrap();
    assert_eq!(summary.rules_processed, 0);
    assert_eq!(summary.instances_created, 0);
    // Only the synchronously created first instance exists.
    assert_eq!(lineage_instances(&repo, rule.lineage_id).await.len(), 1);
}

#[tokio::test]
async fn test_reference_binding_enforces_lineage() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();

    let (template_a, _rule_a) = repo
        .create_series(series_data(
            org,
            "Series A",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    let (_template_b, rule_b) = repo
        .create_series(series_data(
            org,
            "Series B",
            utc(2024, 1, 20),
            monthly_until(utc(2024, 12, 20)),
        ))
        .await
        .unwrap();

    let foreign_instance = lineage_instances(&repo, rule_b.lineage_id).await.remove(0);
    let result = repo
        .bind_reference(org, template_a.id, Some(foreign_instance.id))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    let missing = repo
        .bind_reference(org, template_a.id, Some(Uuid::now_v7()))
        .await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_series_level_reference_resolves_to_upcoming_occurrence() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (template, rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let reference = repo.bind_reference(org, template.id, None).await.unwrap();
    assert!(reference.is_series_level());

    // Resolution floats with the clock instead of pinning one row.
    let resolved = repo
        .resolve_reference(reference.id, utc(2024, 2, 1))
        .await
        .unwrap()
        .expect("an upcoming occurrence exists");
    assert_eq!(resolved.original_starts_at, utc(2024, 2, 15));

    // A cancelled occurrence is skipped at read time.
    repo.cancel_instances(resolved.id, EditScope::InstanceOnly, Uuid::now_v7())
        .await
        .unwrap();
    let resolved = repo
        .resolve_reference(reference.id, utc(2024, 2, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.original_starts_at, utc(2024, 3, 15));

    // Unbinding removes only the dependent record.
    repo.unbind_reference(reference.id).await.unwrap();
    assert_eq!(
        lineage_instances(&repo, rule.lineage_id).await.len(),
        4,
        "instances survive unbinding"
    );
}

#[tokio::test]
async fn test_cancel_this_and_future_stops_regeneration() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();
    let clock = utc(2024, 1, 1);

    setup_window(&repo, org, 3, 12, 1000, clock).await;
    let (_, rule) = repo
        .create_series(series_data(
            org,
            "Monthly sync",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    repo.run_organization(org, clock).await.unwrap();

    let anchor = lineage_instances(&repo, rule.lineage_id)
        .await
        .into_iter()
        .find(|i| i.original_starts_at == utc(2024, 3, 15))
        .unwrap();
    let cancelled = repo
        .cancel_instances(anchor.id, EditScope::ThisAndFuture, Uuid::now_v7())
        .await
        .unwrap();
    assert_eq!(cancelled, 2);

    // Later runs cannot regrow the cancelled tail: the rule's validity was
    // closed just before the anchor.
    let summary = repo.run_organization(org, utc(2024, 6, 1)).await.unwrap();
    assert_eq!(summary.instances_created, 0);

    let instances = lineage_instances(&repo, rule.lineage_id).await;
    let active: Vec<DateTime<Utc>> = instances
        .iter()
        .filter(|i| !i.is_cancelled)
        .map(|i| i.original_starts_at)
        .collect();
    assert_eq!(active, vec![utc(2024, 1, 15), utc(2024, 2, 15)]);
}

#[tokio::test]
async fn test_worker_sweep_serializes_per_organization() {
    let (repo, _temp_dir) = setup_test_db().await;
    let repo = Arc::new(repo);
    let clock = utc(2024, 1, 1);

    // Two organizations, each with a due window.
    let mut lineages = Vec::new();
    for n in 0..2 {
        let org = Uuid::now_v7();
        setup_window(&repo, org, 2, 12, 1000, clock).await;
        let (_, rule) = repo
            .create_series(series_data(
                org,
                &format!("Series {n}"),
                utc(2024, 1, 15),
                monthly_until(utc(2024, 12, 15)),
            ))
            .await
            .unwrap();
        lineages.push(rule.lineage_id);
    }

    let worker = MaterializationWorker::new(repo.clone());
    let report = worker.run_all(clock).await.unwrap();
    assert_eq!(report.organizations_processed, 2);
    assert_eq!(report.organizations_failed, 0);

    for lineage_id in lineages {
        assert_eq!(lineage_instances(&repo, lineage_id).await.len(), 3);
    }

    // Concurrent runs against the same organization serialize on the
    // per-key lock and stay idempotent.
    let org_window = repo
        .find_windows_needing_work(utc(2024, 6, 1), 1, 10)
        .await
        .unwrap();
    if let Some(window) = org_window.first() {
        let (a, b) = tokio::join!(
            worker.run_for_organization(window.organization_id, utc(2024, 6, 1)),
            worker.run_for_organization(window.organization_id, utc(2024, 6, 1)),
        );
        let total = a.unwrap().instances_created + b.unwrap().instances_created;
        // Exactly one materialization of the gap between the two runs.
        let further = repo.run_organization(window.organization_id, utc(2024, 6, 1)).await.unwrap();
        assert_eq!(further.instances_created, 0);
        assert!(total > 0);
    }
}

#[tokio::test]
async fn test_delete_series_cascades_to_rule_instances_and_references() {
    let (repo, _temp_dir) = setup_test_db().await;
    let org = Uuid::now_v7();

    let (template, rule) = repo
        .create_series(series_data(
            org,
            "Ephemeral",
            utc(2024, 1, 15),
            monthly_until(utc(2024, 12, 15)),
        ))
        .await
        .unwrap();
    let instance = lineage_instances(&repo, rule.lineage_id).await.remove(0);
    repo.bind_reference(org, template.id, Some(instance.id))
        .await
        .unwrap();

    repo.delete_series(template.id).await.unwrap();

    assert!(repo.find_template_by_id(template.id).await.unwrap().is_none());
    assert!(repo
        .find_rule_by_template(template.id)
        .await
        .unwrap()
        .is_none());
    assert!(repo.find_instance_by_id(instance.id).await.unwrap().is_none());

    let result = repo.delete_series(template.id).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}
