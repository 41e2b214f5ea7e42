//! Parse raw crash call stacks into ordered frames.

use crate::error::EngineError;

/// Module name used when a frame carries none.
pub const UNKNOWN_MODULE: &str = "Unknown";

/// Modules that never identify the crashing component.
const SYSTEM_MODULES: &[&str] = &[
  "unknown",
  "kernel32",
  "kernelbase",
  "ntdll",
  "user32",
  "msvcrt",
  "ucrtbase",
  "libc",
  "libc++abi",
  "libsystem_c",
  "libsystem_kernel",
  "libsystem_pthread",
  "libpthread",
  "libdyld",
];

/// Engine binary prefixes stripped from the reported module name.
const MODULE_PREFIXES: &[&str] = &["UE4Editor-", "UE4Game-", "UE4-"];

/// One stack frame, line information stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallStackFrame {
  pub module: String,
  pub function: String,
}

/// Ordered frames of one crash, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
  pub frames: Vec<CallStackFrame>,
}

impl CallStack {
  /// Parse a multi-line call stack.
  ///
  /// Each line looks like `[0xADDRESS] Module!Function(args) [file:line]`.
  /// Blank lines are skipped; a stack with no frames is an error.
  pub fn parse(raw: &str) -> Result<Self, EngineError> {
    let frames: Vec<CallStackFrame> = raw.lines().filter_map(parse_line).collect();
    if frames.is_empty() {
      return Err(EngineError::CallStack("no frames in call stack".into()));
    }
    Ok(Self { frames })
  }

  pub fn function_names(&self) -> impl Iterator<Item = &str> {
    self.frames.iter().map(|f| f.function.as_str())
  }

  /// Module of the first frame that belongs to the application rather than the OS.
  pub fn module_name(&self) -> String {
    self
      .frames
      .iter()
      .map(|f| f.module.as_str())
      .find(|m| !is_system_module(m))
      .map(strip_module_prefix)
      .unwrap_or(UNKNOWN_MODULE)
      .to_string()
  }
}

fn parse_line(line: &str) -> Option<CallStackFrame> {
  let mut rest = line.trim();
  if rest.is_empty() {
    return None;
  }

  // Leading instruction address.
  if let Some((first, tail)) = rest.split_once(char::is_whitespace) {
    if first.starts_with("0x") || first.starts_with("0X") {
      rest = tail.trim_start();
    }
  }

  // Trailing source location.
  if let Some(idx) = rest.rfind(" [") {
    if rest.ends_with(']') {
      rest = rest[..idx].trim_end();
    }
  }

  let (module, function) = match rest.split_once('!') {
    Some((m, f)) => (m.trim(), f.trim()),
    None => (UNKNOWN_MODULE, rest),
  };

  let function = function.split('(').next().unwrap_or(function).trim();
  if function.is_empty() {
    return None;
  }

  let module = if module.is_empty() { UNKNOWN_MODULE } else { module };
  Some(CallStackFrame {
    module: module.to_string(),
    function: function.to_string(),
  })
}

fn is_system_module(module: &str) -> bool {
  let lower = module.to_ascii_lowercase();
  let stem = lower
    .strip_suffix(".dll")
    .or_else(|| lower.strip_suffix(".dylib"))
    .or_else(|| lower.strip_suffix(".so"))
    .unwrap_or(&lower);
  SYSTEM_MODULES.contains(&stem)
}

fn strip_module_prefix(module: &str) -> &str {
  MODULE_PREFIXES
    .iter()
    .find_map(|p| module.strip_prefix(p))
    .unwrap_or(module)
}
