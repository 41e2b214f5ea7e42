//! Stable call-stack patterns used as the clustering key.

use tracing::warn;

use crate::callstack::CallStack;
use crate::config::Config;
use crate::error::EngineError;
use crate::function_table::FunctionCallTable;
use crate::types::{CrashRecord, Pattern};

/// Build a pattern from the first `max_frames` frames of a call stack.
///
/// Each function name is interned and the ids are joined in stack order, so
/// identical stacks always map to the same pattern. Frames past `max_frames`
/// do not contribute.
pub fn build(
  stack: &CallStack,
  table: &FunctionCallTable,
  max_frames: usize,
  delimiter: &str,
) -> Result<Pattern, EngineError> {
  let ids = stack
    .function_names()
    .take(max_frames)
    .map(|name| table.intern(name).map(|id| id.to_string()))
    .collect::<Result<Vec<String>, EngineError>>()?;
  Ok(Pattern(ids.join(delimiter)))
}

/// Fill in a crash's pattern and module if the pattern has not been computed yet.
///
/// Returns `true` when a new pattern was written. A call stack that cannot be
/// parsed or interned is logged and leaves the pattern unset; the crash is then
/// skipped by grouping.
pub fn ensure_pattern(crash: &mut CrashRecord, table: &FunctionCallTable, config: &Config) -> bool {
  if crash.pattern().is_some() {
    return false;
  }

  let stack = match CallStack::parse(&crash.raw_call_stack) {
    Ok(s) => s,
    Err(e) => {
      warn!(crash_id = crash.id, error = %e, "pattern build failed");
      return false;
    }
  };

  let pattern = match build(&stack, table, config.max_pattern_frames, &config.pattern_delimiter) {
    Ok(p) => p,
    Err(e) => {
      warn!(crash_id = crash.id, error = %e, "pattern build failed");
      return false;
    }
  };
  crash.module = Some(stack.module_name());
  if pattern.is_empty() {
    return false;
  }
  crash.pattern = Some(pattern);
  true
}
