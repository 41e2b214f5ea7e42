//! Append-only dictionary of function names to stable integer ids.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::EngineError;
use crate::types::{FunctionCallEntry, Pattern};

#[derive(Debug, Default)]
struct Inner {
  ids: HashMap<String, u32>,
  names: BTreeMap<u32, String>,
  next_id: u32,
}

/// Interns function names. Safe to share between concurrent report runs.
///
/// A name is inserted at most once: concurrent callers racing on the same new
/// name serialize on the write lock and the losers read the winner's id.
#[derive(Debug)]
pub struct FunctionCallTable {
  inner: RwLock<Inner>,
}

impl Default for FunctionCallTable {
  fn default() -> Self {
    Self::new()
  }
}

impl FunctionCallTable {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(Inner {
        next_id: 1,
        ..Inner::default()
      }),
    }
  }

  /// Rebuild a table from a persisted snapshot.
  pub fn from_entries(entries: impl IntoIterator<Item = FunctionCallEntry>) -> Result<Self, EngineError> {
    let mut inner = Inner {
      next_id: 1,
      ..Inner::default()
    };
    for entry in entries {
      if entry.id == 0 {
        return Err(EngineError::validation("function_calls.id", "ids start at 1"));
      }
      if inner.ids.contains_key(&entry.name) || inner.names.contains_key(&entry.id) {
        return Err(EngineError::validation(
          "function_calls",
          &format!("duplicate entry {} => {:?}", entry.id, entry.name),
        ));
      }
      inner.next_id = inner.next_id.max(next_after(entry.id)?);
      inner.ids.insert(entry.name.clone(), entry.id);
      inner.names.insert(entry.id, entry.name);
    }
    Ok(Self {
      inner: RwLock::new(inner),
    })
  }

  /// Id for `name`, allocating the next one on first sighting.
  ///
  /// Fails only once the id space is used up; nothing is inserted then.
  pub fn intern(&self, name: &str) -> Result<u32, EngineError> {
    if let Some(&id) = self.inner.read().ids.get(name) {
      return Ok(id);
    }

    let guard = self.inner.upgradable_read();
    if let Some(&id) = guard.ids.get(name) {
      return Ok(id);
    }
    let mut inner = parking_lot::RwLockUpgradableReadGuard::upgrade(guard);
    let id = inner.next_id;
    inner.next_id = next_after(id)?;
    inner.ids.insert(name.to_string(), id);
    inner.names.insert(id, name.to_string());
    tracing::debug!(id, name, "interned function call");
    Ok(id)
  }

  pub fn lookup(&self, name: &str) -> Option<u32> {
    self.inner.read().ids.get(name).copied()
  }

  pub fn name_of(&self, id: u32) -> Option<String> {
    self.inner.read().names.get(&id).cloned()
  }

  /// Function names for a pattern, in stack order. Unknown ids are skipped.
  pub fn resolve_pattern(&self, pattern: &Pattern, delimiter: &str) -> Vec<String> {
    let inner = self.inner.read();
    pattern
      .function_ids(delimiter)
      .into_iter()
      .filter_map(|id| inner.names.get(&id).cloned())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.read().names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Snapshot ordered by id, suitable for persisting.
  pub fn entries(&self) -> Vec<FunctionCallEntry> {
    self
      .inner
      .read()
      .names
      .iter()
      .map(|(&id, name)| FunctionCallEntry {
        id,
        name: name.clone(),
      })
      .collect()
  }
}

fn next_after(id: u32) -> Result<u32, EngineError> {
  id
    .checked_add(1)
    .ok_or_else(|| EngineError::validation("function_calls.id", &format!("no id left after {}", id)))
}
