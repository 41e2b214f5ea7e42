//! Issue-tracker reconciliation: one batched ticket search per run, fanned out to clusters.
//!
//! The tracker itself is a collaborator behind [`IssueTracker`]. Everything
//! here degrades instead of failing: an unusable tracker, a timeout or a
//! failed search leaves clusters without ticket metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::types::{Cluster, IssueTicket, TicketMetadata, TrackerCatalog};

/// External ticket system.
pub trait IssueTracker: Send + Sync {
  /// Health/capability check; nothing else is called when this is false.
  fn can_be_used(&self) -> bool;

  fn catalog(&self) -> Result<TrackerCatalog, EngineError>;

  /// Tickets matching `query`, restricted to `fields`.
  fn search(&self, query: &TrackerQuery, fields: &[String]) -> Result<Vec<IssueTicket>, EngineError>;

  /// Create a ticket for a cluster and return its key.
  fn create(&self, cluster: &Cluster) -> Result<String, EngineError>;
}

/// Disjunction of `key = X` clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerQuery {
  keys: Vec<String>,
}

impl TrackerQuery {
  pub fn keys(&self) -> &[String] {
    &self.keys
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  /// Query text as understood by the tracker, e.g. `key = UE-1 OR key = UE-2`.
  pub fn to_query_string(&self) -> String {
    self
      .keys
      .iter()
      .map(|k| format!("key = {}", k))
      .collect::<Vec<_>>()
      .join(" OR ")
  }
}

/// Tracker key -> positions of the clusters that reference it.
///
/// Built before any ticket is applied so clusters are never mutated while the
/// mapping is still being collected.
#[derive(Debug, Clone, Default)]
pub struct TicketIndex {
  keys: Vec<String>,
  by_key: HashMap<String, Vec<usize>>,
}

impl TicketIndex {
  pub fn collect(clusters: &[Cluster]) -> Self {
    let mut index = Self::default();
    for (pos, cluster) in clusters.iter().enumerate() {
      if let Some(key) = cluster.tracker_key() {
        index.add(key, pos);
      }
    }
    index
  }

  pub fn add(&mut self, key: &str, pos: usize) {
    if !self.by_key.contains_key(key) {
      self.keys.push(key.to_string());
    }
    let slots = self.by_key.entry(key.to_string()).or_default();
    if !slots.contains(&pos) {
      slots.push(pos);
    }
  }

  pub fn positions(&self, key: &str) -> &[usize] {
    self.by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn query(&self) -> TrackerQuery {
    TrackerQuery {
      keys: self.keys.clone(),
    }
  }
}

/// Connects clusters to an [`IssueTracker`] with a bounded search.
pub struct TrackerBridge {
  tracker: Arc<dyn IssueTracker>,
  timeout: Duration,
  fields: Vec<String>,
}

impl TrackerBridge {
  pub fn new(tracker: Arc<dyn IssueTracker>, config: &Config) -> Self {
    Self {
      tracker,
      timeout: config.tracker_timeout(),
      fields: vec![
        "key".into(),
        "summary".into(),
        "components".into(),
        "resolution".into(),
        "fixVersions".into(),
        config.tracker_fix_changelist_field.clone(),
      ],
    }
  }

  pub fn disabled(config: &Config) -> Self {
    Self::new(Arc::new(DisabledTracker), config)
  }

  /// Known version/branch/platform names. Empty when the tracker is unavailable.
  pub fn catalog(&self) -> TrackerCatalog {
    if !self.tracker.can_be_used() {
      return TrackerCatalog::default();
    }
    self.tracker.catalog().unwrap_or_else(|e| {
      warn!(error = %e, "tracker catalog unavailable");
      TrackerCatalog::default()
    })
  }

  /// Create a ticket for `cluster` and record its key on the cluster.
  pub fn promote(&self, cluster: &mut Cluster) -> Result<String, EngineError> {
    if !self.tracker.can_be_used() {
      return Err(EngineError::tracker("tracker cannot be used"));
    }
    let key = self.tracker.create(cluster)?;
    info!(cluster_id = cluster.id, key = %key, "promoted cluster to tracker");
    cluster.tracker_id = Some(key.clone());
    Ok(key)
  }

  /// Copy ticket metadata onto every cluster in `index`. Returns the number of
  /// clusters updated.
  pub fn reconcile(&self, clusters: &mut [Cluster], index: &TicketIndex) -> usize {
    if !self.tracker.can_be_used() {
      debug!("tracker unusable, skipping reconciliation");
      return 0;
    }

    let query = index.query();
    if query.is_empty() {
      return 0;
    }

    let tickets = match self.search(query) {
      Ok(t) => t,
      Err(e) => {
        warn!(error = %e, "tracker search failed, clusters keep no ticket metadata");
        return 0;
      }
    };

    let mut updated = 0;
    for ticket in &tickets {
      let positions = index.positions(&ticket.key);
      if positions.is_empty() {
        debug!(key = %ticket.key, "ticket not referenced by any cluster");
        continue;
      }
      let metadata = ticket_metadata(ticket);
      for &pos in positions {
        if let Some(cluster) = clusters.get_mut(pos) {
          cluster.ticket = metadata.clone();
          updated += 1;
        }
      }
    }
    updated
  }

  fn search(&self, query: TrackerQuery) -> Result<Vec<IssueTicket>, EngineError> {
    let (tx, rx) = channel::bounded(1);
    let tracker = Arc::clone(&self.tracker);
    let fields = self.fields.clone();

    debug!(query = %query.to_query_string(), "tracker search");
    std::thread::Builder::new()
      .name("tracker-search".into())
      .spawn(move || {
        // The receiver is gone if the run already timed out.
        let _ = tx.send(tracker.search(&query, &fields));
      })
      .map_err(|e| EngineError::tracker(format!("spawn search worker: {}", e)))?;

    match rx.recv_timeout(self.timeout) {
      Ok(result) => result,
      Err(RecvTimeoutError::Timeout) => Err(EngineError::TrackerTimeout(self.timeout)),
      Err(RecvTimeoutError::Disconnected) => Err(EngineError::tracker("search worker exited without a result")),
    }
  }
}

/// Missing sub-fields become empty strings; a zero fix changelist is dropped.
fn ticket_metadata(ticket: &IssueTicket) -> TicketMetadata {
  TicketMetadata {
    summary: Some(ticket.summary.clone().unwrap_or_default()),
    components: Some(ticket.components.join(" ")),
    resolution: Some(ticket.resolution.clone().unwrap_or_default()),
    fix_versions: Some(ticket.fix_versions.join(" ")),
    fix_changelist: ticket.fix_changelist.filter(|&cl| cl != 0).map(|cl| cl.to_string()),
  }
}

// ---------------------------------------------------------------------------
// Built-in trackers
// ---------------------------------------------------------------------------

/// Tracker that is never usable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTracker;

impl IssueTracker for DisabledTracker {
  fn can_be_used(&self) -> bool {
    false
  }

  fn catalog(&self) -> Result<TrackerCatalog, EngineError> {
    Ok(TrackerCatalog::default())
  }

  fn search(&self, _query: &TrackerQuery, _fields: &[String]) -> Result<Vec<IssueTicket>, EngineError> {
    Err(EngineError::tracker("tracker disabled"))
  }

  fn create(&self, _cluster: &Cluster) -> Result<String, EngineError> {
    Err(EngineError::tracker("tracker disabled"))
  }
}

/// Offline tracker contents, as accepted in a report input document.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSnapshot {
  pub project: String,
  #[serde(default)]
  pub catalog: TrackerCatalog,
  #[serde(default)]
  pub tickets: Vec<IssueTicket>,
}

/// Tracker backed by an in-memory ticket list.
#[derive(Debug)]
pub struct InMemoryTracker {
  project: String,
  catalog: TrackerCatalog,
  tickets: RwLock<Vec<IssueTicket>>,
}

impl InMemoryTracker {
  pub fn new(snapshot: TrackerSnapshot) -> Self {
    Self {
      project: snapshot.project,
      catalog: snapshot.catalog,
      tickets: RwLock::new(snapshot.tickets),
    }
  }

  pub fn tickets(&self) -> Vec<IssueTicket> {
    self.tickets.read().clone()
  }
}

impl IssueTracker for InMemoryTracker {
  fn can_be_used(&self) -> bool {
    true
  }

  fn catalog(&self) -> Result<TrackerCatalog, EngineError> {
    Ok(self.catalog.clone())
  }

  fn search(&self, query: &TrackerQuery, _fields: &[String]) -> Result<Vec<IssueTicket>, EngineError> {
    Ok(
      self
        .tickets
        .read()
        .iter()
        .filter(|t| query.keys().contains(&t.key))
        .cloned()
        .collect(),
    )
  }

  fn create(&self, cluster: &Cluster) -> Result<String, EngineError> {
    let mut tickets = self.tickets.write();
    let key = format!("{}-{}", self.project, tickets.len() + 1);
    tickets.push(IssueTicket {
      key: key.clone(),
      summary: Some(cluster.draft.summary.clone()),
      fix_versions: Vec::new(),
      components: Vec::new(),
      resolution: None,
      fix_changelist: None,
    });
    Ok(key)
  }
}
