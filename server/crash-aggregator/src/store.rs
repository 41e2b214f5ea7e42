//! Collaborator interfaces (crash store, cluster registry, user segments) and in-memory backends.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::EngineError;
use crate::types::{ClusterSeed, CrashRecord, Pattern, UserSegment};

/// Segment id that disables user filtering.
pub const ALL_USER_SEGMENT_ID: i64 = -1;

/// Source of crash records. The engine only ever writes the cached pattern.
pub trait CrashStore: Send + Sync {
  fn list_all(&self) -> Result<Vec<CrashRecord>, EngineError>;

  /// Keep crashes with `from <= time_of_crash < to_exclusive`.
  fn filter_by_date(
    &self,
    crashes: Vec<CrashRecord>,
    from: DateTime<Utc>,
    to_exclusive: DateTime<Utc>,
  ) -> Vec<CrashRecord> {
    crashes
      .into_iter()
      .filter(|c| c.time_of_crash >= from && c.time_of_crash < to_exclusive)
      .collect()
  }

  fn save_pattern(&self, crash_id: i64, pattern: &Pattern, module: Option<&str>) -> Result<(), EngineError>;
}

/// Durable clusters keyed by pattern. Seeds carry identity and tracker linkage.
pub trait ClusterRegistry: Send + Sync {
  fn find_by_patterns(&self, patterns: &[&Pattern]) -> Result<HashMap<Pattern, ClusterSeed>, EngineError>;
}

/// Resolves user segments to member user ids.
pub trait SegmentDirectory: Send + Sync {
  /// First segment whose name contains `name`.
  fn segment_id(&self, name: &str) -> Result<Option<i64>, EngineError>;

  fn user_ids(&self, segment_id: i64) -> Result<HashSet<i64>, EngineError>;
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryCrashStore {
  crashes: RwLock<Vec<CrashRecord>>,
}

impl InMemoryCrashStore {
  pub fn new(crashes: Vec<CrashRecord>) -> Self {
    Self {
      crashes: RwLock::new(crashes),
    }
  }

  pub fn get(&self, crash_id: i64) -> Option<CrashRecord> {
    self.crashes.read().iter().find(|c| c.id == crash_id).cloned()
  }
}

impl CrashStore for InMemoryCrashStore {
  fn list_all(&self) -> Result<Vec<CrashRecord>, EngineError> {
    Ok(self.crashes.read().clone())
  }

  fn save_pattern(&self, crash_id: i64, pattern: &Pattern, module: Option<&str>) -> Result<(), EngineError> {
    let mut crashes = self.crashes.write();
    let crash = crashes
      .iter_mut()
      .find(|c| c.id == crash_id)
      .ok_or_else(|| EngineError::store(format!("crash {} not found", crash_id)))?;
    crash.pattern = Some(pattern.clone());
    if let Some(m) = module {
      crash.module = Some(m.to_string());
    }
    Ok(())
  }
}

#[derive(Debug, Default)]
pub struct InMemoryClusterRegistry {
  by_pattern: HashMap<Pattern, ClusterSeed>,
}

impl InMemoryClusterRegistry {
  pub fn new(seeds: impl IntoIterator<Item = ClusterSeed>) -> Self {
    let mut by_pattern = HashMap::new();
    for seed in seeds {
      // First registration wins, like a unique index on the pattern column.
      by_pattern.entry(seed.pattern.clone()).or_insert(seed);
    }
    Self { by_pattern }
  }
}

impl ClusterRegistry for InMemoryClusterRegistry {
  fn find_by_patterns(&self, patterns: &[&Pattern]) -> Result<HashMap<Pattern, ClusterSeed>, EngineError> {
    Ok(
      patterns
        .iter()
        .filter_map(|p| self.by_pattern.get(*p).map(|s| ((*p).clone(), s.clone())))
        .collect(),
    )
  }
}

#[derive(Debug, Default)]
pub struct InMemorySegments {
  segments: Vec<UserSegment>,
}

impl InMemorySegments {
  pub fn new(segments: Vec<UserSegment>) -> Self {
    Self { segments }
  }
}

impl SegmentDirectory for InMemorySegments {
  fn segment_id(&self, name: &str) -> Result<Option<i64>, EngineError> {
    Ok(self.segments.iter().find(|s| s.name.contains(name)).map(|s| s.id))
  }

  fn user_ids(&self, segment_id: i64) -> Result<HashSet<i64>, EngineError> {
    let segment = self
      .segments
      .iter()
      .find(|s| s.id == segment_id)
      .ok_or_else(|| EngineError::store(format!("user segment {} not found", segment_id)))?;
    Ok(segment.user_ids.iter().copied().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::CrashType;
  use chrono::TimeZone;

  fn crash(id: i64, day: u32) -> CrashRecord {
    CrashRecord {
      id,
      time_of_crash: Utc.with_ymd_and_hms(2015, 2, day, 12, 0, 0).unwrap(),
      user_id: 1,
      machine_id: None,
      build_version: String::new(),
      platform: String::new(),
      branch: None,
      fixed_changelist: None,
      built_from_cl: String::new(),
      raw_call_stack: String::new(),
      pattern: None,
      module: None,
      crash_type: CrashType::Crash,
      tracker_id: None,
    }
  }

  #[test]
  fn filter_by_date_is_half_open() {
    let store = InMemoryCrashStore::new(vec![crash(1, 10), crash(2, 11), crash(3, 12)]);
    let from = Utc.with_ymd_and_hms(2015, 2, 10, 12, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2015, 2, 12, 12, 0, 0).unwrap();
    let kept = store.filter_by_date(store.list_all().unwrap(), from, to);
    let ids: Vec<i64> = kept.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2]);
  }

  #[test]
  fn save_pattern_updates_record() {
    let store = InMemoryCrashStore::new(vec![crash(1, 10)]);
    store.save_pattern(1, &Pattern("1+2".into()), Some("Core")).unwrap();
    let c = store.get(1).unwrap();
    assert_eq!(c.pattern, Some(Pattern("1+2".into())));
    assert_eq!(c.module.as_deref(), Some("Core"));
    assert!(store.save_pattern(99, &Pattern("1".into()), None).is_err());
  }

  #[test]
  fn registry_returns_only_known_patterns() {
    let registry = InMemoryClusterRegistry::new(vec![ClusterSeed {
      id: 10,
      pattern: Pattern("1+2".into()),
      tracker_id: None,
      fixed_changelist: None,
      time_of_first_crash: None,
    }]);
    let known = Pattern("1+2".into());
    let unknown = Pattern("3".into());
    let found = registry.find_by_patterns(&[&known, &unknown]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[&known].id, 10);
  }

  #[test]
  fn segment_lookup_by_name_fragment() {
    let dir = InMemorySegments::new(vec![UserSegment {
      id: 3,
      name: "Anonymous Users".into(),
      user_ids: vec![7, 8],
    }]);
    assert_eq!(dir.segment_id("Anonymous").unwrap(), Some(3));
    assert_eq!(dir.segment_id("Epic").unwrap(), None);
    assert_eq!(dir.user_ids(3).unwrap(), HashSet::from([7, 8]));
    assert!(dir.user_ids(4).is_err());
  }
}
