//! Crash report aggregation engine: deterministic clustering of crash reports.
//!
//! Interns call-stack function names into stable patterns, groups crashes in a
//! date window by pattern, aggregates the most frequent patterns into clusters
//! ("buggs") seeded from a durable registry, and reconciles clusters with an
//! external issue tracker.
//!
//! Persistence, the tracker transport and presentation live outside this crate
//! behind the traits in [`store`] and [`tracker`].

pub mod callstack;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod function_table;
pub mod grouping;
pub mod pattern;
pub mod store;
pub mod tracker;
pub mod types;

pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;
pub use function_table::FunctionCallTable;
pub use types::{Cluster, CrashRecord, ReportInput, ReportRequest, ReportView};
