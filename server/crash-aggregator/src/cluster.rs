//! Cluster ("bugg") aggregation over the top pattern groups.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::function_table::FunctionCallTable;
use crate::grouping::PatternGroup;
use crate::store::ClusterRegistry;
use crate::types::{Cluster, ClusterSeed, TicketMetadata, TrackerCatalog, TrackerDraft};

/// Summary used when the cluster's call stack has fewer than two functions.
pub const NO_CALLSTACK_SUMMARY: &str = "No valid callstack found";

/// Shared, read-only inputs for per-cluster aggregation.
pub struct AggregationContext<'a> {
  pub config: &'a Config,
  pub functions: &'a FunctionCallTable,
  pub catalog: &'a TrackerCatalog,
}

/// Build clusters for ranked pattern groups.
///
/// Only patterns that already have a registry entry become clusters; the rest
/// are logged and skipped. Output keeps the rank order of `ranked`. A registry
/// failure aborts the run.
pub fn build_clusters(
  ranked: &[PatternGroup<'_>],
  registry: &dyn ClusterRegistry,
  ctx: &AggregationContext<'_>,
) -> Result<Vec<Cluster>, EngineError> {
  let patterns: Vec<_> = ranked.iter().map(|g| g.pattern).collect();
  let seeds = registry.find_by_patterns(&patterns)?;

  let work: Vec<(&PatternGroup<'_>, &ClusterSeed)> = ranked
    .iter()
    .filter_map(|group| match seeds.get(group.pattern) {
      Some(seed) => Some((group, seed)),
      None => {
        warn!(pattern = %group.pattern.as_str(), "no registered cluster for pattern");
        None
      }
    })
    .collect();

  let run = || -> Vec<Cluster> {
    work
      .par_iter()
      .map(|(group, seed)| aggregate(group, seed, ctx))
      .collect()
  };

  if ctx.config.aggregation_threads == 0 {
    return Ok(run());
  }
  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(ctx.config.aggregation_threads)
    .build()
    .map_err(|e| EngineError::validation("aggregation_threads", &e.to_string()))?;
  Ok(pool.install(run))
}

/// Aggregate every crash of one pattern onto its registry seed.
pub fn aggregate(group: &PatternGroup<'_>, seed: &ClusterSeed, ctx: &AggregationContext<'_>) -> Cluster {
  let config = ctx.config;

  let mut machines: HashSet<&str> = HashSet::new();
  let mut affected_versions = BTreeSet::new();
  let mut branches_found_in = BTreeSet::new();
  let mut affected_platforms = BTreeSet::new();
  let mut first_changelist: Option<u32> = None;

  for crash in &group.members {
    if let Some(id) = crash.machine_id.as_deref() {
      if id.chars().count() == config.machine_id_len {
        machines.insert(id);
      }
    }

    if !crash.build_version.starts_with(&config.build_version_prefix) {
      continue;
    }

    affected_versions.insert(crash.build_version.clone());

    if let Some(branch) = crash.branch.as_deref() {
      if branch.starts_with(&config.branch_prefix) {
        branches_found_in.insert(branch.to_string());
      }
    }

    let cl = parse_changelist(&crash.built_from_cl);
    if cl > 0 {
      first_changelist = Some(first_changelist.map_or(cl, |f| f.min(cl)));
    }

    if let Some(platform) = crash.platform.split_whitespace().next() {
      affected_platforms.insert(platform.to_string());
    }
  }

  // Lexicographic, not a version compare.
  let build_version = affected_versions.iter().next_back().cloned();

  let affected_major_versions: BTreeSet<String> =
    affected_versions.iter().filter_map(|v| major_version(v)).collect();

  let latest_changelist_affected = build_version.as_ref().and_then(|latest| {
    group
      .members
      .iter()
      .filter(|c| &c.build_version == latest)
      .map(|c| parse_changelist(&c.built_from_cl))
      .max()
  });

  let latest_os_affected = group
    .members
    .iter()
    .min_by_key(|c| Reverse(c.time_of_crash))
    .map(|c| c.platform.clone());

  let names = ctx
    .functions
    .resolve_pattern(&seed.pattern, &config.pattern_delimiter);
  let summary = if names.len() > 1 {
    names[0].clone()
  } else {
    NO_CALLSTACK_SUMMARY.to_string()
  };

  let draft = TrackerDraft {
    summary,
    first_changelist_affected: first_changelist,
    versions: affected_major_versions
      .iter()
      .filter(|v| ctx.catalog.versions.contains(*v))
      .cloned()
      .collect(),
    branches: tracker_branches(&branches_found_in, ctx.catalog, &config.release_branch_marker),
    platforms: affected_platforms
      .iter()
      .filter(|p| ctx.catalog.platforms.contains(*p))
      .cloned()
      .collect(),
  };

  debug!(
    cluster_id = seed.id,
    pattern = %seed.pattern.digest(),
    crashes = group.count(),
    machines = machines.len(),
    "aggregated cluster"
  );

  Cluster {
    id: seed.id,
    pattern: seed.pattern.clone(),
    pattern_digest: seed.pattern.digest(),
    tracker_id: seed.tracker_id.clone(),
    fixed_changelist: seed.fixed_changelist.clone(),
    number_of_crashes: group.count(),
    number_of_unique_machines: machines.len() as u64,
    affected_versions,
    affected_major_versions,
    branches_found_in,
    affected_platforms,
    build_version,
    first_changelist_affected: first_changelist,
    latest_changelist_affected,
    latest_os_affected,
    time_of_first_crash: seed.time_of_first_crash,
    draft,
    ticket: TicketMetadata::default(),
  }
}

/// Changelist number; anything unparseable counts as 0.
pub fn parse_changelist(raw: &str) -> u32 {
  raw.trim().parse().unwrap_or(0)
}

/// First two dot-separated components: "4.10.1-CL123" -> "4.10".
pub fn major_version(version: &str) -> Option<String> {
  let mut parts = version.split('.').filter(|s| !s.is_empty());
  let major = parts.next()?;
  let minor = parts.next()?;
  Some(format!("{}.{}", major, minor))
}

fn tracker_branches(branches: &BTreeSet<String>, catalog: &TrackerCatalog, release_marker: &str) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for branch in branches {
    let cleaned = if branch.contains(release_marker) {
      release_marker
    } else {
      branch.as_str()
    };
    if catalog.branches.contains(cleaned) && !out.iter().any(|b| b == cleaned) {
      out.push(cleaned.to_string());
    }
  }
  out
}
