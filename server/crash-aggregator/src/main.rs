//! Binary entrypoint: read one ReportInput JSON document from stdin, write a ReportView to stdout.
//!
//! Patterns missing from crashes in the window are built first, then the
//! report is generated; both the new patterns and the grown function table are
//! part of the output. On failure a single ErrorOutput object is written and
//! the process exits with status 1. Logs go to stderr (`RUST_LOG` overrides
//! the default `info` level).

use crash_aggregator::types::ErrorOutput;
use crash_aggregator::{Config, Engine, EngineError, ReportInput, ReportView};
use std::io::{self, Read, Write};
use tracing_subscriber::EnvFilter;

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());

  let code = match run() {
    Ok(report) => {
      let _ = serde_json::to_writer(&mut out, &report);
      0
    }
    Err(e) => {
      tracing::error!(error = %e, "report failed");
      let err = match &e {
        EngineError::Validation { field, reason } => ErrorOutput::new(reason.clone()).with_field(field.clone()),
        _ => ErrorOutput::new(e.to_string()),
      };
      let _ = serde_json::to_writer(&mut out, &err);
      1
    }
  };

  let _ = writeln!(out);
  let _ = out.flush();
  drop(out);
  std::process::exit(code);
}

fn run() -> Result<ReportView, EngineError> {
  let mut raw = String::new();
  io::stdin()
    .read_to_string(&mut raw)
    .map_err(|e| EngineError::parse(format!("read stdin: {}", e)))?;

  let mut input: ReportInput = serde_json::from_str(raw.trim())?;
  let config = match input.config.take() {
    Some(c) => c,
    None => Config::from_env()?,
  };

  let (engine, request) = Engine::in_memory(config, input)?;
  engine.run_report(&request)
}
