use crate::domain::models::{
    ItemSource, Recurrence, RecurrenceMode, RecurrencePattern, RecurrenceRule, ScheduleItem,
    Termination,
};
use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ExpansionPolicy {
    pub look_ahead: Duration,
    pub max_occurrences_per_run: usize,
    /// Zone in which wall-clock stepping happens.
    pub time_zone: Tz,
}

impl Default for ExpansionPolicy {
    fn default() -> Self {
        Self {
            look_ahead: Duration::days(30),
            max_occurrences_per_run: 500,
            time_zone: Tz::UTC,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionPlan {
    pub occurrences_to_create: Vec<ScheduleItem>,
    pub occurrence_to_refresh: Option<ScheduleItem>,
    /// No series instant remains after the last known one.
    pub exhausted: bool,
}

impl ExpansionPlan {
    pub fn is_noop(&self) -> bool {
        self.occurrences_to_create.is_empty()
            && self.occurrence_to_refresh.is_none()
            && !self.exhausted
    }
}

/// Computes what a recurring definition needs as of `as_of`.
///
/// `existing` holds the rows already generated from `definition` (other rows are
/// ignored). The result depends only on the arguments, so evaluating the same
/// inputs twice after applying the first plan yields a no-op.
pub fn expand(
    definition: &ScheduleItem,
    existing: &[ScheduleItem],
    as_of: DateTime<Utc>,
    policy: &ExpansionPolicy,
) -> Result<ExpansionPlan, String> {
    let Some(recurrence) = definition.recurrence.as_ref() else {
        return Err(format!("item {} is not recurring", definition.id));
    };
    if definition.parent_id.is_some() {
        return Err(format!(
            "item {} is a generated occurrence, not a definition",
            definition.id
        ));
    }
    recurrence.rule.validate()?;

    if recurrence.inert {
        return Ok(ExpansionPlan::default());
    }

    match recurrence.mode {
        RecurrenceMode::Clone => Ok(expand_clone(definition, recurrence, existing, as_of, policy)),
        RecurrenceMode::Refresh => Ok(expand_refresh(definition, recurrence, as_of, policy)),
    }
}

fn expand_clone(
    definition: &ScheduleItem,
    recurrence: &Recurrence,
    existing: &[ScheduleItem],
    as_of: DateTime<Utc>,
    policy: &ExpansionPolicy,
) -> ExpansionPlan {
    let materialized = existing
        .iter()
        .filter(|item| item.parent_id.as_deref() == Some(definition.id.as_str()))
        .map(|item| item.start_at)
        .collect::<HashSet<_>>();
    let last_known = materialized
        .iter()
        .copied()
        .chain(std::iter::once(definition.start_at))
        .max()
        .unwrap_or(definition.start_at);
    let horizon = as_of + policy.look_ahead;

    let mut series = SeriesInstants::new(&recurrence.rule, recurrence.anchor, policy.time_zone)
        .skip_while(|instant| *instant <= last_known)
        .peekable();
    let mut plan = ExpansionPlan::default();

    while let Some(&instant) = series.peek() {
        if instant > horizon || plan.occurrences_to_create.len() >= policy.max_occurrences_per_run {
            break;
        }
        series.next();
        if materialized.contains(&instant) {
            continue;
        }
        plan.occurrences_to_create
            .push(occurrence_from(definition, instant, as_of));
    }

    plan.exhausted = series.peek().is_none();
    plan
}

fn expand_refresh(
    definition: &ScheduleItem,
    recurrence: &Recurrence,
    as_of: DateTime<Utc>,
    policy: &ExpansionPolicy,
) -> ExpansionPlan {
    let current = definition.start_at;
    let mut series = SeriesInstants::new(&recurrence.rule, recurrence.anchor, policy.time_zone)
        .skip_while(|instant| *instant <= current)
        .peekable();

    let mut latest_due = None;
    while let Some(&instant) = series.peek() {
        if instant > as_of {
            break;
        }
        latest_due = Some(instant);
        series.next();
    }

    let exhausted = series.peek().is_none();
    let occurrence_to_refresh = latest_due.map(|instant| {
        let mut refreshed = definition.clone();
        refreshed.end_at = definition.duration().map(|duration| instant + duration);
        refreshed.start_at = instant;
        refreshed.last_updated_at = refresh_edit_time(definition, as_of);
        if let Some(recurrence) = refreshed.recurrence.as_mut() {
            recurrence.inert = exhausted;
        }
        refreshed
    });

    ExpansionPlan {
        occurrences_to_create: Vec::new(),
        occurrence_to_refresh,
        exhausted,
    }
}

/// A refresh is an edit: it must land after every timestamp the row carries,
/// or a sync that finished after `as_of` would see the moved row as clean.
fn refresh_edit_time(definition: &ScheduleItem, as_of: DateTime<Utc>) -> DateTime<Utc> {
    let latest_known = definition
        .synced_at
        .map_or(definition.last_updated_at, |synced_at| {
            synced_at.max(definition.last_updated_at)
        });
    if as_of > latest_known {
        as_of
    } else {
        latest_known + Duration::microseconds(1)
    }
}

pub fn occurrence_id(definition_id: &str, instant: DateTime<Utc>) -> String {
    format!("{definition_id}#{}", instant.timestamp())
}

fn occurrence_from(
    definition: &ScheduleItem,
    instant: DateTime<Utc>,
    as_of: DateTime<Utc>,
) -> ScheduleItem {
    ScheduleItem {
        id: occurrence_id(&definition.id, instant),
        owner_id: definition.owner_id.clone(),
        kind: definition.kind,
        title: definition.title.clone(),
        description: definition.description.clone(),
        start_at: instant,
        end_at: definition.duration().map(|duration| instant + duration),
        recurrence: None,
        parent_id: Some(definition.id.clone()),
        source: ItemSource::Local,
        external_id: None,
        last_updated_at: as_of,
        synced_at: None,
        created_at: as_of,
    }
}

/// Every instant of a series in chronological order, starting with the anchor
/// and ending when the termination condition is met.
pub struct SeriesInstants<'a> {
    rule: &'a RecurrenceRule,
    time_zone: Tz,
    anchor_date: NaiveDate,
    anchor_time: NaiveTime,
    ordinal: u32,
    cursor: Option<NaiveDate>,
    finished: bool,
}

impl<'a> SeriesInstants<'a> {
    pub fn new(rule: &'a RecurrenceRule, anchor: DateTime<Utc>, time_zone: Tz) -> Self {
        let local = anchor.with_timezone(&time_zone).naive_local();
        Self {
            rule,
            time_zone,
            anchor_date: local.date(),
            anchor_time: local.time(),
            ordinal: 0,
            cursor: None,
            finished: false,
        }
    }

    fn next_date(&self) -> Option<NaiveDate> {
        let Some(cursor) = self.cursor else {
            return Some(self.anchor_date);
        };
        match &self.rule.pattern {
            RecurrencePattern::Daily => cursor.checked_add_days(Days::new(1)),
            RecurrencePattern::Weekly(days) => {
                let mut candidate = cursor;
                for _ in 0..7 {
                    candidate = candidate.checked_add_days(Days::new(1))?;
                    if days.contains(&candidate.weekday()) {
                        return Some(candidate);
                    }
                }
                None
            }
            RecurrencePattern::Monthly => {
                add_months_clamped(self.anchor_date, self.ordinal)
            }
            RecurrencePattern::Yearly => {
                add_months_clamped(self.anchor_date, self.ordinal.checked_mul(12)?)
            }
        }
    }
}

impl Iterator for SeriesInstants<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Termination::Count(count) = self.rule.termination {
            if self.ordinal >= count {
                self.finished = true;
                return None;
            }
        }

        let Some(date) = self.next_date() else {
            self.finished = true;
            return None;
        };
        if let Termination::Until(until) = self.rule.termination {
            if date > until {
                self.finished = true;
                return None;
            }
        }

        self.cursor = Some(date);
        self.ordinal = self.ordinal.saturating_add(1);
        Some(resolve_local(self.time_zone, date.and_time(self.anchor_time)))
    }
}

/// Same day of month `months` later, clamped to the last valid day.
pub fn add_months_clamped(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    let total = i64::from(date.year()) * 12 + i64::from(date.month0()) + i64::from(months);
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    let last_day = last_day_of_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, date.day().min(last_day))
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year.checked_add(1)?, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|date| date.day())
}

// Ambiguous wall times take the earlier instant; times inside a DST gap move
// forward by the gap.
fn resolve_local(time_zone: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match time_zone.from_local_datetime(&local) {
        LocalResult::Single(value) => value.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = local + Duration::hours(1);
            match time_zone.from_local_datetime(&shifted) {
                LocalResult::Single(value) | LocalResult::Ambiguous(value, _) => {
                    value.with_timezone(&Utc)
                }
                LocalResult::None => Utc.from_utc_datetime(&local),
            }
        }
    }
}
