//! Core types for the crash aggregator (JSON contracts + internal models).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::Config;
use crate::tracker::TrackerSnapshot;

// ---------------------------------------------------------------------------
// Crash records
// ---------------------------------------------------------------------------

/// Kind of report submitted by the crash reporter.
///
/// Serialized by lowercase name; accepted either by name or by database code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "CrashTypeRepr")]
pub enum CrashType {
  Crash,
  Assert,
  Ensure,
  Other,
}

impl CrashType {
  /// Numeric code used by the crash database (1 = crash, 2 = assert, 3 = ensure).
  pub fn from_code(code: i64) -> Self {
    match code {
      1 => Self::Crash,
      2 => Self::Assert,
      3 => Self::Ensure,
      _ => Self::Other,
    }
  }

  /// Only crashes and asserts feed cluster reports.
  pub fn is_reportable(self) -> bool {
    matches!(self, Self::Crash | Self::Assert)
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CrashTypeRepr {
  Code(i64),
  Name(String),
}

impl TryFrom<CrashTypeRepr> for CrashType {
  type Error = String;

  fn try_from(repr: CrashTypeRepr) -> Result<Self, Self::Error> {
    let name = match repr {
      CrashTypeRepr::Code(code) => return Ok(Self::from_code(code)),
      CrashTypeRepr::Name(name) => name,
    };
    match name.to_ascii_lowercase().as_str() {
      "crash" => Ok(Self::Crash),
      "assert" => Ok(Self::Assert),
      "ensure" => Ok(Self::Ensure),
      "other" => Ok(Self::Other),
      _ => Err(format!("unknown crash type {:?}", name)),
    }
  }
}

/// Call-stack fingerprint: interned function ids joined by the pattern delimiter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(pub String);

impl Pattern {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Interned ids in stack order. Segments that are not ids are skipped.
  pub fn function_ids(&self, delimiter: &str) -> Vec<u32> {
    self
      .0
      .split(delimiter)
      .filter_map(|s| s.trim().parse().ok())
      .collect()
  }

  /// Compact, stable key for logs (16 hex chars of blake3).
  pub fn digest(&self) -> String {
    let hex = blake3::hash(self.0.as_bytes()).to_hex();
    hex[..16].to_string()
  }
}

/// One crash report. Immutable apart from the cached pattern and module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
  pub id: i64,
  pub time_of_crash: DateTime<Utc>,
  pub user_id: i64,
  #[serde(default)]
  pub machine_id: Option<String>,
  #[serde(default)]
  pub build_version: String,
  #[serde(default)]
  pub platform: String,
  #[serde(default)]
  pub branch: Option<String>,
  #[serde(default)]
  pub fixed_changelist: Option<String>,
  #[serde(default)]
  pub built_from_cl: String,
  #[serde(default)]
  pub raw_call_stack: String,
  #[serde(default)]
  pub pattern: Option<Pattern>,
  #[serde(default)]
  pub module: Option<String>,
  pub crash_type: CrashType,
  #[serde(default)]
  pub tracker_id: Option<String>,
}

impl CrashRecord {
  /// Pattern if one has been computed and is non-empty.
  pub fn pattern(&self) -> Option<&Pattern> {
    self.pattern.as_ref().filter(|p| !p.is_empty())
  }
}

/// Interned function name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCallEntry {
  pub id: u32,
  pub name: String,
}

/// Pattern written back to a crash during backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternUpdate {
  pub crash_id: i64,
  pub pattern: Pattern,
  #[serde(default)]
  pub module: Option<String>,
}

/// Named partition of users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSegment {
  pub id: i64,
  pub name: String,
  #[serde(default)]
  pub user_ids: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Clusters ("buggs")
// ---------------------------------------------------------------------------

/// Durable part of a cluster, as held by the cluster registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSeed {
  pub id: i64,
  pub pattern: Pattern,
  #[serde(default)]
  pub tracker_id: Option<String>,
  #[serde(default)]
  pub fixed_changelist: Option<String>,
  #[serde(default)]
  pub time_of_first_crash: Option<DateTime<Utc>>,
}

/// Ticket fields copied back from the issue tracker. All `None` until reconciled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TicketMetadata {
  pub summary: Option<String>,
  pub components: Option<String>,
  pub resolution: Option<String>,
  pub fix_versions: Option<String>,
  pub fix_changelist: Option<String>,
}

impl TicketMetadata {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

/// Payload used when a cluster is promoted to a new tracker ticket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerDraft {
  pub summary: String,
  pub first_changelist_affected: Option<u32>,
  pub versions: Vec<String>,
  pub branches: Vec<String>,
  pub platforms: Vec<String>,
}

/// Aggregated view of every crash sharing one pattern.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
  pub id: i64,
  pub pattern: Pattern,
  pub pattern_digest: String,
  pub tracker_id: Option<String>,
  pub fixed_changelist: Option<String>,
  pub number_of_crashes: u64,
  pub number_of_unique_machines: u64,
  pub affected_versions: BTreeSet<String>,
  pub affected_major_versions: BTreeSet<String>,
  pub branches_found_in: BTreeSet<String>,
  pub affected_platforms: BTreeSet<String>,
  /// Latest affected build version (lexicographic max of `affected_versions`).
  pub build_version: Option<String>,
  /// Lowest changelist seen in the valid build series; `None` means unknown.
  pub first_changelist_affected: Option<u32>,
  pub latest_changelist_affected: Option<u32>,
  pub latest_os_affected: Option<String>,
  pub time_of_first_crash: Option<DateTime<Utc>>,
  pub draft: TrackerDraft,
  pub ticket: TicketMetadata,
}

impl Cluster {
  /// Tracker id that names a real ticket. Purely numeric ids are legacy references.
  pub fn tracker_key(&self) -> Option<&str> {
    self
      .tracker_id
      .as_deref()
      .map(str::trim)
      .filter(|id| !id.is_empty() && !id.chars().all(|c| c.is_ascii_digit()))
  }
}

// ---------------------------------------------------------------------------
// Issue tracker
// ---------------------------------------------------------------------------

/// Ticket as returned by a tracker search, restricted to the requested fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTicket {
  pub key: String,
  #[serde(default)]
  pub summary: Option<String>,
  #[serde(default)]
  pub components: Vec<String>,
  #[serde(default)]
  pub resolution: Option<String>,
  #[serde(default)]
  pub fix_versions: Vec<String>,
  #[serde(default)]
  pub fix_changelist: Option<i64>,
}

/// Names the tracker knows about; drafts only reference these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerCatalog {
  #[serde(default)]
  pub versions: BTreeSet<String>,
  #[serde(default)]
  pub branches: BTreeSet<String>,
  #[serde(default)]
  pub platforms: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Report input / output (JSON contract)
// ---------------------------------------------------------------------------

/// Everything the binary needs for one report run.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportInput {
  pub date_from: NaiveDate,
  pub date_to: NaiveDate,
  #[serde(default)]
  pub promote_cluster_id: Option<i64>,
  #[serde(default)]
  pub crashes: Vec<CrashRecord>,
  #[serde(default)]
  pub registry: Vec<ClusterSeed>,
  #[serde(default)]
  pub function_calls: Vec<FunctionCallEntry>,
  #[serde(default)]
  pub segments: Vec<UserSegment>,
  #[serde(default)]
  pub tracker: Option<TrackerSnapshot>,
  #[serde(default)]
  pub config: Option<Config>,
}

/// Parameters of a single report run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRequest {
  pub date_from: NaiveDate,
  /// Inclusive; the whole day is covered.
  pub date_to: NaiveDate,
  pub promote_cluster_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportView {
  pub report_id: String,
  pub user_segment: String,
  /// Epoch milliseconds (UTC midnight of `date_from`).
  pub date_from: i64,
  /// Epoch milliseconds (UTC midnight of `date_to`).
  pub date_to: i64,
  pub total_crashes: u64,
  pub total_unique_patterns: u64,
  pub total_affected_machines: u64,
  pub clusters: Vec<Cluster>,
  /// Full function-call table after this run, including names interned by it.
  pub function_calls: Vec<FunctionCallEntry>,
  /// Patterns backfilled by this run, for the caller to persist.
  pub pattern_updates: Vec<PatternUpdate>,
  pub generation_seconds: f64,
}

/// Structured error output for a failed run.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}
