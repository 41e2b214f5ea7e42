//! Crash selection, grouping by pattern, and date bucketing.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use tracing::warn;

use crate::error::EngineError;
use crate::store::{SegmentDirectory, ALL_USER_SEGMENT_ID};
use crate::types::{CrashRecord, Pattern};

/// Half-open report window: `[from 00:00, to + 1 day 00:00)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
  pub from: DateTime<Utc>,
  pub to_exclusive: DateTime<Utc>,
}

impl DateWindow {
  /// Window covering `date_from` through the whole of `date_to`.
  ///
  /// Fails when the day after `date_to` is not representable.
  pub fn inclusive(date_from: NaiveDate, date_to: NaiveDate) -> Result<Self, EngineError> {
    let end = date_to
      .succ_opt()
      .ok_or_else(|| EngineError::validation("date_to", "date is out of range"))?;
    Ok(Self {
      from: midnight(date_from),
      to_exclusive: midnight(end),
    })
  }

  pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
    *ts >= self.from && *ts < self.to_exclusive
  }
}

pub fn midnight(date: NaiveDate) -> DateTime<Utc> {
  date.and_time(NaiveTime::MIN).and_utc()
}

/// Keep crashes inside the window, of type crash/assert, submitted by one of `segment_users`.
pub fn select(crashes: Vec<CrashRecord>, window: &DateWindow, segment_users: &HashSet<i64>) -> Vec<CrashRecord> {
  crashes
    .into_iter()
    .filter(|c| window.contains(&c.time_of_crash))
    .filter(|c| c.crash_type.is_reportable())
    .filter(|c| segment_users.contains(&c.user_id))
    .collect()
}

/// All crashes sharing one pattern.
#[derive(Debug, Clone)]
pub struct PatternGroup<'a> {
  pub pattern: &'a Pattern,
  pub members: Vec<&'a CrashRecord>,
}

impl PatternGroup<'_> {
  pub fn count(&self) -> u64 {
    self.members.len() as u64
  }
}

/// Group crashes by exact pattern, in order of first appearance.
///
/// Crashes without a pattern are skipped.
pub fn group_by_pattern(crashes: &[CrashRecord]) -> Vec<PatternGroup<'_>> {
  let mut index: HashMap<&Pattern, usize> = HashMap::new();
  let mut groups: Vec<PatternGroup<'_>> = Vec::new();

  for crash in crashes {
    let pattern = match crash.pattern() {
      Some(p) => p,
      None => continue,
    };
    match index.get(pattern) {
      Some(&i) => groups[i].members.push(crash),
      None => {
        index.insert(pattern, groups.len());
        groups.push(PatternGroup {
          pattern,
          members: vec![crash],
        });
      }
    }
  }

  groups
}

/// Top `n` groups by occurrence count, descending. Ties keep grouping order.
pub fn rank_top(mut groups: Vec<PatternGroup<'_>>, n: usize) -> Vec<PatternGroup<'_>> {
  groups.sort_by(|a, b| b.count().cmp(&a.count()));
  groups.truncate(n);
  groups
}

/// Headline counts for a selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionTotals {
  /// Every selected crash, with or without a pattern.
  pub total_crashes: u64,
  pub unique_patterns: u64,
  /// Distinct machine ids among crashes with a pattern.
  pub affected_machines: u64,
}

pub fn totals(crashes: &[CrashRecord], groups: &[PatternGroup<'_>]) -> SelectionTotals {
  let machines: HashSet<&str> = groups
    .iter()
    .flat_map(|g| g.members.iter())
    .filter_map(|c| c.machine_id.as_deref())
    .collect();

  SelectionTotals {
    total_crashes: crashes.len() as u64,
    unique_patterns: groups.len() as u64,
    affected_machines: machines.len() as u64,
  }
}

// ---------------------------------------------------------------------------
// Date buckets
// ---------------------------------------------------------------------------

pub fn day_bucket(ts: &DateTime<Utc>) -> NaiveDate {
  ts.date_naive()
}

/// Start of the week (Sunday) containing `ts`. Clamped to the earliest date.
pub fn week_bucket(ts: &DateTime<Utc>) -> NaiveDate {
  let day = ts.date_naive();
  day
    .checked_sub_signed(Duration::days(i64::from(day.weekday().num_days_from_sunday())))
    .unwrap_or(NaiveDate::MIN)
}

/// Crash counts per day, ascending.
pub fn daily_counts(crashes: &[CrashRecord], segment_id: i64, segments: &dyn SegmentDirectory) -> BTreeMap<NaiveDate, u64> {
  counts_by(crashes, segment_id, segments, day_bucket)
}

/// Crash counts per week, ascending.
pub fn weekly_counts(crashes: &[CrashRecord], segment_id: i64, segments: &dyn SegmentDirectory) -> BTreeMap<NaiveDate, u64> {
  counts_by(crashes, segment_id, segments, week_bucket)
}

/// Bucket crashes, optionally limited to one segment. Never fails: a segment
/// that cannot be resolved is logged and yields an empty mapping.
fn counts_by(
  crashes: &[CrashRecord],
  segment_id: i64,
  segments: &dyn SegmentDirectory,
  bucket: fn(&DateTime<Utc>) -> NaiveDate,
) -> BTreeMap<NaiveDate, u64> {
  let mut out = BTreeMap::new();

  let users = if segment_id == ALL_USER_SEGMENT_ID {
    None
  } else {
    match segments.user_ids(segment_id) {
      Ok(ids) => Some(ids),
      Err(e) => {
        warn!(segment_id, error = %e, "bucket grouping failed");
        return out;
      }
    }
  };

  for crash in crashes {
    if let Some(users) = &users {
      if !users.contains(&crash.user_id) {
        continue;
      }
    }
    *out.entry(bucket(&crash.time_of_crash)).or_insert(0) += 1;
  }

  out
}
