//! Core engine: wires the collaborators together and produces report views.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{info, info_span, warn};

use crate::cluster::{self, AggregationContext};
use crate::config::Config;
use crate::error::EngineError;
use crate::function_table::FunctionCallTable;
use crate::grouping::{self, DateWindow};
use crate::pattern;
use crate::store::{
  ClusterRegistry, CrashStore, InMemoryClusterRegistry, InMemoryCrashStore, InMemorySegments, SegmentDirectory,
};
use crate::tracker::{DisabledTracker, InMemoryTracker, IssueTracker, TicketIndex, TrackerBridge};
use crate::types::*;

/// The crash aggregation engine. Stateless between runs apart from the shared
/// function-call table; every report is recomputed from the crash store.
pub struct Engine {
  config: Config,
  functions: Arc<FunctionCallTable>,
  crashes: Arc<dyn CrashStore>,
  registry: Arc<dyn ClusterRegistry>,
  segments: Arc<dyn SegmentDirectory>,
  tracker: TrackerBridge,
}

impl Engine {
  pub fn new(
    config: Config,
    functions: Arc<FunctionCallTable>,
    crashes: Arc<dyn CrashStore>,
    registry: Arc<dyn ClusterRegistry>,
    segments: Arc<dyn SegmentDirectory>,
    tracker: Arc<dyn IssueTracker>,
  ) -> Self {
    let tracker = TrackerBridge::new(tracker, &config);
    Self {
      config,
      functions,
      crashes,
      registry,
      segments,
      tracker,
    }
  }

  /// Engine over in-memory backends seeded from a report input document.
  pub fn in_memory(config: Config, input: ReportInput) -> Result<(Self, ReportRequest), EngineError> {
    let request = ReportRequest {
      date_from: input.date_from,
      date_to: input.date_to,
      promote_cluster_id: input.promote_cluster_id,
    };
    let functions = Arc::new(FunctionCallTable::from_entries(input.function_calls)?);
    let tracker: Arc<dyn IssueTracker> = match input.tracker {
      Some(snapshot) => Arc::new(InMemoryTracker::new(snapshot)),
      None => Arc::new(DisabledTracker),
    };
    let engine = Self::new(
      config,
      functions,
      Arc::new(InMemoryCrashStore::new(input.crashes)),
      Arc::new(InMemoryClusterRegistry::new(input.registry)),
      Arc::new(InMemorySegments::new(input.segments)),
      tracker,
    );
    Ok((engine, request))
  }

  pub fn functions(&self) -> &FunctionCallTable {
    &self.functions
  }

  /// Backfill missing patterns in the request window, then generate the report.
  ///
  /// The view carries the backfilled patterns and the grown function table so
  /// the caller can persist both.
  pub fn run_report(&self, request: &ReportRequest) -> Result<ReportView, EngineError> {
    let updates = self.backfill_patterns(request.date_from, request.date_to)?;
    let mut report = self.generate_report(request)?;
    report.pattern_updates = updates;
    Ok(report)
  }

  /// Build and persist patterns for crashes in the window that have none yet.
  ///
  /// Returns the patterns written. Failures are per crash: logged and skipped.
  pub fn backfill_patterns(
    &self,
    date_from: NaiveDate,
    date_to: NaiveDate,
  ) -> Result<Vec<PatternUpdate>, EngineError> {
    let window = checked_window(date_from, date_to)?;
    let started = Instant::now();
    let candidates: Vec<CrashRecord> = self
      .crashes
      .filter_by_date(self.crashes.list_all()?, window.from, window.to_exclusive)
      .into_iter()
      .filter(|c| c.pattern().is_none())
      .collect();

    let mut updates = Vec::new();
    for mut crash in candidates {
      if !pattern::ensure_pattern(&mut crash, &self.functions, &self.config) {
        continue;
      }
      let Some(p) = crash.pattern.take() else {
        continue;
      };
      match self.crashes.save_pattern(crash.id, &p, crash.module.as_deref()) {
        Ok(()) => updates.push(PatternUpdate {
          crash_id: crash.id,
          pattern: p,
          module: crash.module,
        }),
        Err(e) => warn!(crash_id = crash.id, error = %e, "saving pattern failed"),
      }
    }

    info!(
      built = updates.len(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "pattern backfill done"
    );
    Ok(updates)
  }

  /// Generate the cluster report for the reference user segment.
  pub fn generate_report(&self, request: &ReportRequest) -> Result<ReportView, EngineError> {
    let started = Instant::now();
    let span = info_span!("report", from = %request.date_from, to = %request.date_to);
    let _enter = span.enter();

    let window = checked_window(request.date_from, request.date_to)?;
    let users = self.reference_users()?;

    let selected = {
      let _stage = info_span!("select").entered();
      let in_range = self
        .crashes
        .filter_by_date(self.crashes.list_all()?, window.from, window.to_exclusive);
      grouping::select(in_range, &window, &users)
    };

    let (totals, ranked) = {
      let _stage = info_span!("group").entered();
      let groups = grouping::group_by_pattern(&selected);
      let totals = grouping::totals(&selected, &groups);
      (totals, grouping::rank_top(groups, self.config.top_clusters))
    };

    let mut clusters = {
      let _stage = info_span!("aggregate", groups = ranked.len()).entered();
      let catalog = self.tracker.catalog();
      let ctx = AggregationContext {
        config: &self.config,
        functions: &self.functions,
        catalog: &catalog,
      };
      cluster::build_clusters(&ranked, self.registry.as_ref(), &ctx)?
    };

    let reconciled = {
      let _stage = info_span!("reconcile").entered();
      let mut index = TicketIndex::collect(&clusters);
      if let Some(cluster_id) = request.promote_cluster_id {
        self.promote(&mut clusters, &mut index, cluster_id);
      }
      self.tracker.reconcile(&mut clusters, &index)
    };

    let elapsed = started.elapsed();
    info!(
      crashes = totals.total_crashes,
      patterns = totals.unique_patterns,
      clusters = clusters.len(),
      reconciled,
      elapsed_ms = elapsed.as_millis() as u64,
      "report generated"
    );

    Ok(ReportView {
      report_id: report_id(request, &self.config.reference_segment),
      user_segment: self.config.reference_segment.clone(),
      date_from: grouping::midnight(request.date_from).timestamp_millis(),
      date_to: grouping::midnight(request.date_to).timestamp_millis(),
      total_crashes: totals.total_crashes,
      total_unique_patterns: totals.unique_patterns,
      total_affected_machines: totals.affected_machines,
      clusters,
      function_calls: self.functions.entries(),
      pattern_updates: Vec::new(),
      generation_seconds: (elapsed.as_secs_f64() * 100.0).round() / 100.0,
    })
  }

  /// Crash counts per day in the window. `ALL_USER_SEGMENT_ID` disables segment filtering.
  pub fn daily_counts(
    &self,
    segment_id: i64,
    date_from: NaiveDate,
    date_to: NaiveDate,
  ) -> Result<BTreeMap<NaiveDate, u64>, EngineError> {
    let crashes = self.crashes_in(date_from, date_to)?;
    Ok(grouping::daily_counts(&crashes, segment_id, self.segments.as_ref()))
  }

  /// Crash counts per week (starting Sunday) in the window.
  pub fn weekly_counts(
    &self,
    segment_id: i64,
    date_from: NaiveDate,
    date_to: NaiveDate,
  ) -> Result<BTreeMap<NaiveDate, u64>, EngineError> {
    let crashes = self.crashes_in(date_from, date_to)?;
    Ok(grouping::weekly_counts(&crashes, segment_id, self.segments.as_ref()))
  }

  fn crashes_in(&self, date_from: NaiveDate, date_to: NaiveDate) -> Result<Vec<CrashRecord>, EngineError> {
    let window = checked_window(date_from, date_to)?;
    Ok(
      self
        .crashes
        .filter_by_date(self.crashes.list_all()?, window.from, window.to_exclusive),
    )
  }

  fn reference_users(&self) -> Result<HashSet<i64>, EngineError> {
    let name = &self.config.reference_segment;
    let segment_id = self
      .segments
      .segment_id(name)?
      .ok_or_else(|| EngineError::UnknownSegment(name.clone()))?;
    self.segments.user_ids(segment_id)
  }

  fn promote(&self, clusters: &mut [Cluster], index: &mut TicketIndex, cluster_id: i64) {
    let Some(pos) = clusters.iter().position(|c| c.id == cluster_id) else {
      warn!(cluster_id, "cluster to promote is not part of this report");
      return;
    };
    match self.tracker.promote(&mut clusters[pos]) {
      Ok(key) => index.add(&key, pos),
      Err(e) => warn!(cluster_id, error = %e, "promoting cluster failed"),
    }
  }
}

fn checked_window(date_from: NaiveDate, date_to: NaiveDate) -> Result<DateWindow, EngineError> {
  if date_to < date_from {
    return Err(EngineError::validation("date_to", "must not be before date_from"));
  }
  DateWindow::inclusive(date_from, date_to)
}

/// Stable report id: hash of the date range and user segment.
fn report_id(request: &ReportRequest, segment: &str) -> String {
  let mut hasher = blake3::Hasher::new();
  hasher.update(request.date_from.to_string().as_bytes());
  hasher.update(b"|");
  hasher.update(request.date_to.to_string().as_bytes());
  hasher.update(b"|");
  hasher.update(segment.as_bytes());
  let hex = hasher.finalize().to_hex();
  format!("rpt-{}", &hex[..16])
}
