//! Integration tests for the crash aggregator.

use crash_aggregator::types::{ClusterSeed, CrashRecord, CrashType, Pattern, PatternUpdate};
use crash_aggregator::{Config, Engine, ReportInput};
use pretty_assertions::assert_eq;

fn fixture_input() -> ReportInput {
  let json = r#"{
    "date_from": "2015-02-10",
    "date_to": "2015-02-12",
    "segments": [
      {"id": 1, "name": "Anonymous", "user_ids": [100, 101]},
      {"id": 2, "name": "Epic", "user_ids": [200]}
    ],
    "registry": [
      {"id": 501, "pattern": "1+2+3", "tracker_id": "UE-7001", "time_of_first_crash": "2015-01-02T08:00:00Z"},
      {"id": 502, "pattern": "4+5", "tracker_id": "88231"}
    ],
    "function_calls": [
      {"id": 1, "name": "FDebug::AssertFailed"},
      {"id": 2, "name": "UWorld::Tick"},
      {"id": 3, "name": "FEngineLoop::Tick"},
      {"id": 4, "name": "FRHICommandList::Flush"},
      {"id": 5, "name": "FRenderingThread::Run"}
    ],
    "crashes": [
      {"id": 1, "time_of_crash": "2015-02-10T09:00:00Z", "user_id": 100, "crash_type": "crash",
       "machine_id": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "build_version": "4.7.0-2400100",
       "platform": "Win64 [Windows 7 Service Pack 1]", "branch": "UE4-Releases+4.7", "built_from_cl": "2400100",
       "pattern": "1+2+3"},
      {"id": 2, "time_of_crash": "2015-02-12T23:30:00Z", "user_id": 101, "crash_type": "assert",
       "machine_id": "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB", "build_version": "4.7.1-2400500",
       "platform": "Mac [10.10.2]", "branch": "UE4", "built_from_cl": "2400500",
       "pattern": "1+2+3"},
      {"id": 3, "time_of_crash": "2015-02-11T12:00:00Z", "user_id": 100, "crash_type": "crash",
       "machine_id": "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC", "build_version": "4.6.1",
       "platform": "Win64", "built_from_cl": "2380000", "pattern": "4+5"},
      {"id": 4, "time_of_crash": "2015-02-11T12:00:00Z", "user_id": 100, "crash_type": "crash",
       "machine_id": "DDDD", "build_version": "4.6.1", "platform": "Win64", "built_from_cl": ""},
      {"id": 5, "time_of_crash": "2015-02-11T13:00:00Z", "user_id": 100, "crash_type": "ensure",
       "machine_id": "EEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE", "build_version": "4.7.0", "pattern": "1+2+3"},
      {"id": 6, "time_of_crash": "2015-02-11T13:00:00Z", "user_id": 200, "crash_type": "crash",
       "machine_id": "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF", "build_version": "4.7.0", "pattern": "1+2+3"},
      {"id": 7, "time_of_crash": "2015-02-13T00:00:00Z", "user_id": 100, "crash_type": "crash",
       "machine_id": "GGGGGGGGGGGGGGGGGGGGGGGGGGGGGGGG", "build_version": "4.7.0", "pattern": "1+2+3"}
    ],
    "tracker": {
      "project": "UE",
      "catalog": {"versions": ["4.7"], "branches": ["UE4-Releases"], "platforms": ["Win64", "Mac"]},
      "tickets": [
        {"key": "UE-7001", "summary": "Assert in UWorld::Tick", "components": ["Engine", "Gameplay"],
         "fix_versions": ["4.8"], "fix_changelist": 2450000}
      ]
    }
  }"#;
  serde_json::from_str(json).unwrap()
}

fn crash(id: i64, pattern: &str, machine: &str) -> CrashRecord {
  CrashRecord {
    id,
    time_of_crash: "2015-02-11T10:00:00Z".parse().unwrap(),
    user_id: 100,
    machine_id: Some(machine.into()),
    build_version: "4.7.0".into(),
    platform: "Win64".into(),
    branch: None,
    fixed_changelist: None,
    built_from_cl: "2400000".into(),
    raw_call_stack: String::new(),
    pattern: Some(Pattern(pattern.into())),
    module: None,
    crash_type: CrashType::Crash,
    tracker_id: None,
  }
}

fn seed(id: i64, pattern: &str) -> ClusterSeed {
  ClusterSeed {
    id,
    pattern: Pattern(pattern.into()),
    tracker_id: None,
    fixed_changelist: None,
    time_of_first_crash: None,
  }
}

#[test]
fn fixture_report_has_expected_clusters() {
  let (engine, request) = Engine::in_memory(Config::default(), fixture_input()).unwrap();
  let report = engine.generate_report(&request).unwrap();

  // Crashes 1-4 pass every filter; 5 is an ensure, 6 another segment, 7 past the window.
  assert_eq!(report.total_crashes, 4);
  assert_eq!(report.total_unique_patterns, 2);
  assert_eq!(report.total_affected_machines, 3);

  let ids: Vec<i64> = report.clusters.iter().map(|c| c.id).collect();
  assert_eq!(ids, vec![501, 502]);

  let top = &report.clusters[0];
  assert_eq!(top.number_of_crashes, 2);
  assert_eq!(top.number_of_unique_machines, 2);
  assert_eq!(top.build_version.as_deref(), Some("4.7.1-2400500"));
  assert_eq!(top.first_changelist_affected, Some(2_400_100));
  assert_eq!(top.latest_changelist_affected, Some(2_400_500));
  assert_eq!(top.latest_os_affected.as_deref(), Some("Mac [10.10.2]"));
  assert_eq!(
    top.affected_platforms.iter().cloned().collect::<Vec<_>>(),
    vec!["Mac".to_string(), "Win64".to_string()]
  );
  assert_eq!(top.draft.summary, "FDebug::AssertFailed");
  assert_eq!(top.draft.versions, vec!["4.7".to_string()]);
  assert_eq!(top.draft.branches, vec!["UE4-Releases".to_string()]);
  assert_eq!(top.time_of_first_crash.unwrap().to_rfc3339(), "2015-01-02T08:00:00+00:00");

  // Ticket metadata comes from the tracker; missing resolution becomes empty.
  assert_eq!(top.ticket.summary.as_deref(), Some("Assert in UWorld::Tick"));
  assert_eq!(top.ticket.components.as_deref(), Some("Engine Gameplay"));
  assert_eq!(top.ticket.resolution.as_deref(), Some(""));
  assert_eq!(top.ticket.fix_changelist.as_deref(), Some("2450000"));

  // Numeric tracker ids are legacy references and never looked up.
  let legacy = &report.clusters[1];
  assert_eq!(legacy.tracker_id.as_deref(), Some("88231"));
  assert!(legacy.ticket.is_empty());
}

#[test]
fn disabled_tracker_leaves_ticket_fields_empty() {
  let mut input = fixture_input();
  input.tracker = None;
  let (engine, request) = Engine::in_memory(Config::default(), input).unwrap();
  let report = engine.generate_report(&request).unwrap();

  assert!(!report.clusters.is_empty());
  assert!(report.clusters.iter().all(|c| c.ticket.is_empty()));
  assert!(report.clusters.iter().all(|c| c.draft.versions.is_empty()));
}

#[test]
fn three_crash_scenario() {
  let mut input = fixture_input();
  input.tracker = None;
  input.crashes = vec![
    crash(1, "1+2+3", &"A".repeat(32)),
    crash(2, "1+2+3", &"B".repeat(32)),
    crash(3, "4+5", &"C".repeat(32)),
  ];
  let (engine, request) = Engine::in_memory(Config::default(), input).unwrap();
  let report = engine.generate_report(&request).unwrap();

  assert_eq!(report.clusters.len(), 2);
  assert_eq!(report.clusters[0].pattern.as_str(), "1+2+3");
  assert_eq!(report.clusters[0].number_of_crashes, 2);
  assert_eq!(report.clusters[0].number_of_unique_machines, 2);
  assert_eq!(report.clusters[1].pattern.as_str(), "4+5");
  assert_eq!(report.clusters[1].number_of_crashes, 1);
}

#[test]
fn crash_without_pattern_counts_only_in_totals() {
  let mut input = fixture_input();
  input.tracker = None;
  let mut unpatterned = crash(2, "", &"B".repeat(32));
  unpatterned.pattern = None;
  input.crashes = vec![crash(1, "4+5", &"A".repeat(32)), unpatterned];
  let (engine, request) = Engine::in_memory(Config::default(), input).unwrap();
  let report = engine.generate_report(&request).unwrap();

  assert_eq!(report.total_crashes, 2);
  assert_eq!(report.total_unique_patterns, 1);
  assert_eq!(report.clusters[0].number_of_crashes, 1);
}

#[test]
fn top_clusters_capped_at_one_hundred() {
  let mut input = fixture_input();
  input.tracker = None;
  input.crashes.clear();
  input.registry.clear();
  for p in 0..150i64 {
    // Pattern p occurs (p % 7) + 1 times.
    for n in 0..(p % 7) + 1 {
      input.crashes.push(crash(p * 10 + n, &p.to_string(), &format!("{:0>32}", p)));
    }
    input.registry.push(seed(1000 + p, &p.to_string()));
  }

  let (engine, request) = Engine::in_memory(Config::default(), input).unwrap();
  let report = engine.generate_report(&request).unwrap();

  assert_eq!(report.clusters.len(), 100);
  assert_eq!(report.total_unique_patterns, 150);
  assert!(report
    .clusters
    .windows(2)
    .all(|w| w[0].number_of_crashes >= w[1].number_of_crashes));
  assert_eq!(report.clusters[0].number_of_crashes, 7);
  // Ties keep first-seen order: pattern 6 is the first with seven crashes.
  assert_eq!(report.clusters[0].pattern.as_str(), "6");
}

#[test]
fn patterns_built_from_raw_stacks_cluster_together() {
  let mut input = fixture_input();
  input.tracker = None;
  input.function_calls.clear();
  input.registry = vec![seed(900, "1+2")];

  let stack = "0x000007FEFD2A2C2B KERNELBASE!RaiseException()\nUE4Editor-Core!FDebug::AssertFailed() [d:\\core\\Misc.cpp:355]";
  let mut a = crash(1, "", &"A".repeat(32));
  a.pattern = None;
  a.raw_call_stack = stack.into();
  let mut b = a.clone();
  b.id = 2;
  b.machine_id = Some("B".repeat(32));
  input.crashes = vec![a, b];

  let (engine, request) = Engine::in_memory(Config::default(), input).unwrap();
  assert_eq!(engine.backfill_patterns(request.date_from, request.date_to).unwrap().len(), 2);

  let report = engine.generate_report(&request).unwrap();
  assert_eq!(report.clusters.len(), 1);
  assert_eq!(report.clusters[0].number_of_crashes, 2);
  assert_eq!(report.clusters[0].draft.summary, "RaiseException");
}

#[test]
fn report_serializes_deterministically_apart_from_timing() {
  let (engine1, request) = Engine::in_memory(Config::default(), fixture_input()).unwrap();
  let (engine2, _) = Engine::in_memory(Config::default(), fixture_input()).unwrap();

  let mut r1 = engine1.generate_report(&request).unwrap();
  let mut r2 = engine2.generate_report(&request).unwrap();
  r1.generation_seconds = 0.0;
  r2.generation_seconds = 0.0;

  assert_eq!(serde_json::to_string(&r1).unwrap(), serde_json::to_string(&r2).unwrap());
}

#[test]
fn function_table_from_one_run_keeps_patterns_stable_in_the_next() {
  let stack_a = "UE4Editor-Core!FDebug::AssertFailed()\nUE4Editor-Engine!UWorld::Tick()";
  let stack_b = "UE4Editor-Renderer!FRHICommandList::Flush()\nUE4Editor-Engine!UWorld::Tick()";
  let unpatterned = |id: i64, stack: &str| {
    let mut c = crash(id, "", &"A".repeat(32));
    c.pattern = None;
    c.raw_call_stack = stack.into();
    c
  };

  let mut first = fixture_input();
  first.tracker = None;
  first.function_calls.clear();
  first.crashes = vec![unpatterned(1, stack_a), unpatterned(2, stack_b)];
  let (engine, request) = Engine::in_memory(Config::default(), first).unwrap();
  let run1 = engine.run_report(&request).unwrap();
  assert_eq!(run1.pattern_updates.len(), 2);
  assert_eq!(run1.function_calls.len(), 3);

  // Opposite order: a fresh table would hand out different ids.
  let mut second = fixture_input();
  second.tracker = None;
  second.function_calls = run1.function_calls.clone();
  second.crashes = vec![unpatterned(2, stack_b), unpatterned(1, stack_a)];
  let (engine, request) = Engine::in_memory(Config::default(), second).unwrap();
  let run2 = engine.run_report(&request).unwrap();

  let by_crash = |updates: &[PatternUpdate]| {
    let mut v: Vec<(i64, String)> = updates
      .iter()
      .map(|u| (u.crash_id, u.pattern.as_str().to_string()))
      .collect();
    v.sort();
    v
  };
  assert_eq!(by_crash(&run2.pattern_updates), by_crash(&run1.pattern_updates));
  assert_eq!(run2.function_calls, run1.function_calls);

  // Applying the updates means nothing is left to backfill.
  let mut third = fixture_input();
  third.tracker = None;
  third.function_calls = run1.function_calls.clone();
  third.crashes = vec![unpatterned(1, stack_a), unpatterned(2, stack_b)];
  for update in &run1.pattern_updates {
    if let Some(c) = third.crashes.iter_mut().find(|c| c.id == update.crash_id) {
      c.pattern = Some(update.pattern.clone());
      c.module = update.module.clone();
    }
  }
  let (engine, request) = Engine::in_memory(Config::default(), third).unwrap();
  assert!(engine.run_report(&request).unwrap().pattern_updates.is_empty());
}

#[test]
fn numeric_crash_type_codes_are_accepted() {
  let json = r#"{
    "date_from": "2015-02-10",
    "date_to": "2015-02-12",
    "segments": [{"id": 1, "name": "Anonymous", "user_ids": [100]}],
    "registry": [{"id": 9, "pattern": "1+2"}],
    "crashes": [
      {"id": 1, "time_of_crash": "2015-02-11T09:00:00Z", "user_id": 100, "crash_type": 1, "pattern": "1+2"},
      {"id": 2, "time_of_crash": "2015-02-11T10:00:00Z", "user_id": 100, "crash_type": 2, "pattern": "1+2"},
      {"id": 3, "time_of_crash": "2015-02-11T11:00:00Z", "user_id": 100, "crash_type": 3, "pattern": "1+2"}
    ]
  }"#;
  let input: ReportInput = serde_json::from_str(json).unwrap();
  let (engine, request) = Engine::in_memory(Config::default(), input).unwrap();
  let report = engine.generate_report(&request).unwrap();
  assert_eq!(report.total_crashes, 2);
  assert_eq!(report.clusters[0].number_of_crashes, 2);
}
