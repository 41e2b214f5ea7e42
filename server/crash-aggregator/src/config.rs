//! Engine configuration with sane defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// Tunable limits and filters for report generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Number of most frequent patterns turned into clusters.
  pub top_clusters: usize,
  /// Max stack frames that contribute to a pattern.
  pub max_pattern_frames: usize,
  /// Separator between interned function ids in a pattern.
  pub pattern_delimiter: String,
  /// Only machine ids of exactly this length count as distinct machines.
  pub machine_id_len: usize,
  /// Build versions outside this series are ignored by cluster aggregation.
  pub build_version_prefix: String,
  /// Branches must start with this prefix to be recorded on a cluster.
  pub branch_prefix: String,
  /// Release branches are collapsed onto this name when drafting tickets.
  pub release_branch_marker: String,
  /// Name of the user segment the report is scoped to.
  pub reference_segment: String,
  /// Upper bound for the batched tracker search.
  pub tracker_timeout_ms: u64,
  /// Tracker field holding the fix changelist.
  pub tracker_fix_changelist_field: String,
  /// Worker threads for per-cluster aggregation (0 = rayon default).
  pub aggregation_threads: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      top_clusters: 100,
      max_pattern_frames: 64,
      pattern_delimiter: "+".into(),
      machine_id_len: 32,
      build_version_prefix: "4.".into(),
      branch_prefix: "UE4".into(),
      release_branch_marker: "UE4-Releases".into(),
      reference_segment: "Anonymous".into(),
      tracker_timeout_ms: 10_000,
      tracker_fix_changelist_field: "customfield_11200".into(),
      aggregation_threads: 0,
    }
  }
}

impl Config {
  /// Defaults overlaid with `CRASH_AGG_*` environment variables.
  pub fn from_env() -> Result<Self, EngineError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
    let mut config = Self::default();

    if let Some(v) = lookup("CRASH_AGG_TOP_CLUSTERS") {
      config.top_clusters = parse_number("CRASH_AGG_TOP_CLUSTERS", &v)?;
    }
    if let Some(v) = lookup("CRASH_AGG_MAX_PATTERN_FRAMES") {
      config.max_pattern_frames = parse_number("CRASH_AGG_MAX_PATTERN_FRAMES", &v)?;
    }
    if let Some(v) = lookup("CRASH_AGG_REFERENCE_SEGMENT") {
      if v.trim().is_empty() {
        return Err(EngineError::validation("CRASH_AGG_REFERENCE_SEGMENT", "must not be empty"));
      }
      config.reference_segment = v.trim().to_string();
    }
    if let Some(v) = lookup("CRASH_AGG_TRACKER_TIMEOUT_MS") {
      config.tracker_timeout_ms = parse_number("CRASH_AGG_TRACKER_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("CRASH_AGG_THREADS") {
      config.aggregation_threads = parse_number("CRASH_AGG_THREADS", &v)?;
    }

    Ok(config)
  }

  pub fn tracker_timeout(&self) -> Duration {
    Duration::from_millis(self.tracker_timeout_ms)
  }
}

fn parse_number<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, EngineError> {
  raw
    .trim()
    .parse()
    .map_err(|_| EngineError::validation(field, &format!("expected a number, got {:?}", raw)))
}
