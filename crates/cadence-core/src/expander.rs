use chrono::{DateTime, Duration, Months, Utc};
use rrule::{RRuleSet, Tz as RRuleTz};

use crate::error::EngineError;
use crate::models::{Frequency, RecurrenceInput, RecurrenceRule};

/// Safety valve so a corrupt rule can never spin the expansion loop.
const MAX_EXPANSION_STEPS: usize = 10_000;

/// One expanded occurrence of a rule, before any per-instance overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    /// 1-based position within the rule, counted from the rule's start.
    pub sequence: i32,
    pub original_starts_at: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Validates a recurrence pattern at creation time.
///
/// Rejection here is what lets expansion assume a well-formed rule: a
/// non-positive interval, an end bound before the series start, both an end
/// date and a count, or an unparseable raw expression never reach the store.
pub fn validate_recurrence(
    input: &RecurrenceInput,
    series_start: DateTime<Utc>,
) -> Result<(), EngineError> {
    if input.interval < 1 {
        return Err(EngineError::InvalidRule(format!(
            "interval must be a positive integer, got {}",
            input.interval
        )));
    }

    if let Some(count) = input.occurrence_count {
        if count < 1 {
            return Err(EngineError::InvalidRule(format!(
                "occurrence count must be at least 1, got {count}"
            )));
        }
        if input.ends_at.is_some() {
            return Err(EngineError::InvalidRule(
                "a rule may be bounded by an end date or a count, not both".to_string(),
            ));
        }
    }

    if let Some(ends_at) = input.ends_at {
        if ends_at < series_start {
            return Err(EngineError::InvalidRule(format!(
                "recurrence end {ends_at} precedes the series start {series_start}"
            )));
        }
    }

    if let Some(text) = &input.rrule_text {
        parse_rrule(text, series_start)?;
    }

    Ok(())
}

/// Expands a rule into the occurrences whose original start falls inside
/// `[from, to]`, each tagged with its sequence number counted from the
/// rule's start.
///
/// Pure and deterministic: every occurrence date is derived directly from the
/// rule start (never from the previous occurrence), so overlapping ranges can
/// never disagree on the date for a given sequence number. `duration` is the
/// template's end minus start and sizes each occurrence.
pub fn occurrences_between(
    rule: &RecurrenceRule,
    duration: Duration,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Occurrence>, EngineError> {
    if to < from {
        return Ok(Vec::new());
    }

    if rule.rrule_text.is_some() {
        return raw_occurrences_between(rule, duration, from, to);
    }

    let mut occurrences = Vec::new();
    let mut step = first_candidate_step(rule, from);

    for _ in 0..MAX_EXPANSION_STEPS {
        let Some(starts_at) = occurrence_start(rule, step) else {
            break;
        };
        let sequence = step as i32 + 1;

        if let Some(count) = rule.occurrence_count {
            if sequence > count {
                break;
            }
        }
        if let Some(ends_at) = rule.ends_at {
            if starts_at > ends_at {
                break;
            }
        }
        if starts_at > to {
            break;
        }
        if starts_at >= from {
            occurrences.push(Occurrence {
                sequence,
                original_starts_at: starts_at,
                starts_at,
                ends_at: starts_at + duration,
            });
        }
        step += 1;
    }

    Ok(occurrences)
}

/// The first occurrence a rule will ever produce, if any. For the native
/// frequencies this is the rule start itself; a raw expression may place it
/// later (or nowhere, when the bounds already exclude everything).
pub fn first_occurrence(
    rule: &RecurrenceRule,
    duration: Duration,
) -> Result<Option<Occurrence>, EngineError> {
    if rule.rrule_text.is_some() {
        let horizon = rule.ends_at.unwrap_or_else(|| {
            rule.starts_at
                .checked_add_months(Months::new(120))
                .unwrap_or(rule.starts_at)
        });
        let mut found = raw_occurrences_between(rule, duration, rule.starts_at, horizon)?;
        if found.is_empty() {
            return Ok(None);
        }
        return Ok(Some(found.remove(0)));
    }
    let found = occurrences_between(rule, duration, rule.starts_at, rule.starts_at)?;
    Ok(found.into_iter().next())
}

/// Total number of occurrences in a finite rule, or `None` when the rule
/// never ends (or is too long to enumerate).
pub fn total_occurrences(rule: &RecurrenceRule) -> Result<Option<i32>, EngineError> {
    if let Some(count) = rule.occurrence_count {
        return Ok(Some(count));
    }
    let Some(ends_at) = rule.ends_at else {
        return Ok(None);
    };

    let all = occurrences_between(rule, Duration::zero(), rule.starts_at, ends_at)?;
    if all.len() >= MAX_EXPANSION_STEPS {
        return Ok(None);
    }
    Ok(Some(all.len() as i32))
}

/// The date of occurrence `step` (0-based), anchored to the rule start so
/// month-length clamping cannot accumulate drift.
fn occurrence_start(rule: &RecurrenceRule, step: usize) -> Option<DateTime<Utc>> {
    let n = step.checked_mul(rule.recur_interval as usize)?;
    match rule.frequency {
        Frequency::Daily => rule
            .starts_at
            .checked_add_signed(Duration::days(n as i64)),
        Frequency::Weekly => rule
            .starts_at
            .checked_add_signed(Duration::weeks(n as i64)),
        Frequency::Monthly => rule.starts_at.checked_add_months(Months::new(n as u32)),
        Frequency::Yearly => rule
            .starts_at
            .checked_add_months(Months::new((n * 12) as u32)),
    }
}

/// Lowest step whose occurrence could fall at or after `from`, so expansion
/// of a far-future range does not walk the whole history. Conservative by one
/// interval; the main loop re-checks the bound.
fn first_candidate_step(rule: &RecurrenceRule, from: DateTime<Utc>) -> usize {
    if from <= rule.starts_at {
        return 0;
    }
    let elapsed = from - rule.starts_at;
    let interval = rule.recur_interval.max(1) as i64;
    let approx = match rule.frequency {
        Frequency::Daily => elapsed.num_days() / interval,
        Frequency::Weekly => elapsed.num_weeks() / interval,
        // 28-day months under-estimate, which is the safe direction.
        Frequency::Monthly => elapsed.num_days() / (31 * interval),
        Frequency::Yearly => elapsed.num_days() / (366 * interval),
    };
    approx.saturating_sub(1).max(0) as usize
}

/// Expansion through the raw RFC 5545 expression, for patterns richer than
/// frequency + interval. Enumeration starts at the rule start so sequence
/// numbers stay stable regardless of the requested range.
fn raw_occurrences_between(
    rule: &RecurrenceRule,
    duration: Duration,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Occurrence>, EngineError> {
    let Some(text) = rule.rrule_text.as_deref() else {
        return Ok(Vec::new());
    };
    let rule_set = parse_rrule(text, rule.starts_at)?;

    let bounded = rule_set.before(to.with_timezone(&RRuleTz::UTC));
    let (dates, _) = bounded.all(MAX_EXPANSION_STEPS as u16);

    let mut occurrences = Vec::new();
    for (index, date) in dates.into_iter().enumerate() {
        let starts_at = date.with_timezone(&Utc);
        let sequence = index as i32 + 1;

        if let Some(count) = rule.occurrence_count {
            if sequence > count {
                break;
            }
        }
        if let Some(ends_at) = rule.ends_at {
            if starts_at > ends_at {
                break;
            }
        }
        if starts_at >= from {
            occurrences.push(Occurrence {
                sequence,
                original_starts_at: starts_at,
                starts_at,
                ends_at: starts_at + duration,
            });
        }
    }

    Ok(occurrences)
}

fn parse_rrule(text: &str, dtstart: DateTime<Utc>) -> Result<RRuleSet, EngineError> {
    let full = if text.contains("DTSTART") {
        text.to_string()
    } else {
        format!(
            "DTSTART:{}\nRRULE:{}",
            dtstart.format("%Y%m%dT%H%M%SZ"),
            text
        )
    };
    full.parse::<RRuleSet>()
        .map_err(|e| EngineError::InvalidRule(format!("failed to parse '{text}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use uuid::Uuid;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    fn rule(frequency: Frequency, interval: i32, starts_at: DateTime<Utc>) -> RecurrenceRule {
        RecurrenceRule {
            id: Uuid::now_v7(),
            template_id: Uuid::now_v7(),
            lineage_id: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            frequency,
            recur_interval: interval,
            rrule_text: None,
            starts_at,
            ends_at: None,
            occurrence_count: None,
            materialized_until: None,
            creator_id: Uuid::now_v7(),
            created_at: starts_at,
            updated_at: None,
        }
    }

    #[rstest]
    #[case(Frequency::Daily, 1, utc(2024, 1, 1), utc(2024, 1, 5), 5)]
    #[case(Frequency::Daily, 3, utc(2024, 1, 1), utc(2024, 1, 10), 4)]
    #[case(Frequency::Weekly, 1, utc(2024, 1, 1), utc(2024, 1, 31), 5)]
    #[case(Frequency::Weekly, 2, utc(2024, 1, 1), utc(2024, 2, 28), 5)]
    #[case(Frequency::Monthly, 1, utc(2024, 1, 15), utc(2024, 6, 30), 6)]
    #[case(Frequency::Yearly, 1, utc(2024, 3, 1), utc(2027, 12, 31), 4)]
    fn counts_occurrences_in_range(
        #[case] frequency: Frequency,
        #[case] interval: i32,
        #[case] start: DateTime<Utc>,
        #[case] to: DateTime<Utc>,
        #[case] expected: usize,
    ) {
        let r = rule(frequency, interval, start);
        let found = occurrences_between(&r, Duration::hours(1), start, to).unwrap();
        assert_eq!(found.len(), expected);
        assert_eq!(found[0].sequence, 1);
        assert_eq!(found[0].original_starts_at, start);
    }

    #[test]
    fn sequences_are_stable_across_overlapping_ranges() {
        let r = rule(Frequency::Daily, 2, utc(2024, 1, 1));
        let wide = occurrences_between(&r, Duration::hours(1), utc(2024, 1, 1), utc(2024, 2, 1))
            .unwrap();
        let narrow =
            occurrences_between(&r, Duration::hours(1), utc(2024, 1, 10), utc(2024, 1, 20))
                .unwrap();

        for occ in &narrow {
            let matching = wide
                .iter()
                .find(|w| w.sequence == occ.sequence)
                .expect("sequence present in wider range");
            assert_eq!(matching.original_starts_at, occ.original_starts_at);
        }
    }

    #[test]
    fn monthly_from_month_end_clamps_without_drift() {
        let r = rule(Frequency::Monthly, 1, utc(2024, 1, 31));
        let found =
            occurrences_between(&r, Duration::hours(1), utc(2024, 1, 1), utc(2024, 4, 30)).unwrap();
        let days: Vec<u32> = found
            .iter()
            .map(|o| chrono::Datelike::day(&o.original_starts_at))
            .collect();
        // Feb clamps to 29 (leap year); later months return to the 31st/30th.
        assert_eq!(days, vec![31, 29, 31, 30]);
    }

    #[test]
    fn end_date_before_next_occurrence_yields_empty() {
        let mut r = rule(Frequency::Monthly, 1, utc(2024, 1, 15));
        r.ends_at = Some(utc(2024, 1, 20));
        let found =
            occurrences_between(&r, Duration::hours(1), utc(2024, 2, 1), utc(2024, 12, 31))
                .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn occurrence_count_bounds_the_series() {
        let mut r = rule(Frequency::Daily, 1, utc(2024, 1, 1));
        r.occurrence_count = Some(3);
        let found =
            occurrences_between(&r, Duration::hours(1), utc(2024, 1, 1), utc(2024, 12, 31))
                .unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found.last().unwrap().sequence, 3);
        assert_eq!(total_occurrences(&r).unwrap(), Some(3));
    }

    #[test]
    fn total_occurrences_derived_from_end_date() {
        let mut r = rule(Frequency::Monthly, 1, utc(2024, 1, 15));
        r.ends_at = Some(utc(2024, 12, 15));
        assert_eq!(total_occurrences(&r).unwrap(), Some(12));

        let unbounded = rule(Frequency::Daily, 1, utc(2024, 1, 1));
        assert_eq!(total_occurrences(&unbounded).unwrap(), None);
    }

    #[test]
    fn far_future_range_skips_ahead() {
        let r = rule(Frequency::Daily, 1, utc(2020, 1, 1));
        let found =
            occurrences_between(&r, Duration::hours(1), utc(2035, 1, 1), utc(2035, 1, 3)).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(
            found[0].sequence,
            (utc(2035, 1, 1) - utc(2020, 1, 1)).num_days() as i32 + 1
        );
    }

    #[test]
    fn raw_expression_expands_with_sequences() {
        let mut r = rule(Frequency::Weekly, 1, utc(2024, 1, 1)); // a Monday
        r.rrule_text = Some("FREQ=WEEKLY;BYDAY=MO,WE".to_string());
        let found =
            occurrences_between(&r, Duration::hours(1), utc(2024, 1, 1), utc(2024, 1, 14)).unwrap();
        // Mon 1st, Wed 3rd, Mon 8th, Wed 10th
        assert_eq!(found.len(), 4);
        assert_eq!(
            found.iter().map(|o| o.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[rstest]
    #[case(0)]
    #[case(-2)]
    fn rejects_non_positive_interval(#[case] interval: i32) {
        let mut input = RecurrenceInput::new(Frequency::Daily);
        input.interval = interval;
        let result = validate_recurrence(&input, utc(2024, 1, 1));
        assert!(matches!(result, Err(EngineError::InvalidRule(_))));
    }

    #[test]
    fn rejects_end_date_and_count_together() {
        let mut input = RecurrenceInput::new(Frequency::Weekly);
        input.ends_at = Some(utc(2024, 6, 1));
        input.occurrence_count = Some(10);
        let result = validate_recurrence(&input, utc(2024, 1, 1));
        assert!(matches!(result, Err(EngineError::InvalidRule(_))));
    }

    #[test]
    fn rejects_unparseable_raw_expression() {
        let mut input = RecurrenceInput::new(Frequency::Weekly);
        input.rrule_text = Some("NOT_A_RULE".to_string());
        let result = validate_recurrence(&input, utc(2024, 1, 1));
        assert!(matches!(result, Err(EngineError::InvalidRule(_))));
    }
}
