// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! End-to-end closure engine behavior: genesis closure, idempotency, streaks,
//! day sweeps, and enforcement escalation.

use fabric_kernel::{FixedClock, Kernel, Mode, SequentialIds};
use fabric_law::{ClosureEngine, ClosureOutcome, ClosureRequest, LawError, LoopRecord, PutSignals};
use fabric_store::{MemoryStore, Store};
use std::sync::Arc;

const T0: u64 = 1_700_000_000_000; // 2023-11-14T22:13:20Z
const DAY: u64 = 86_400_000;

fn engine(dir: &std::path::Path, clock: Arc<FixedClock>) -> ClosureEngine {
    let kernel = Kernel::new(clock, Arc::new(SequentialIds::default()));
    ClosureEngine::new(kernel, dir)
}

fn close(engine: &ClosureEngine, store: &mut MemoryStore, loop_id: &str) -> fabric_law::ClosureReceipt {
    engine
        .close_loop(
            store,
            &ClosureRequest {
                loop_id: Some(loop_id.to_string()),
                title: Some(format!("loop {loop_id}")),
                outcome: ClosureOutcome::Closed,
                source: "user".to_string(),
            },
        )
        .unwrap()
}

#[test]
fn genesis_closure_materializes_skeleton_at_scale() {
    // No system_state, zero open loops. ratio = 1/(0+1) = 1.0 → SCALE,
    // build allowed, streak 1, best 1.
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();

    let receipt = close(&engine, &mut store, "L1");
    assert_eq!(receipt.metrics.closure_ratio, 1.0);
    assert_eq!(receipt.mode, Mode::Scale);
    assert!(receipt.build_allowed);
    assert!(receipt.mode_changed);
    assert_eq!(receipt.streak.streak_days, 1);
    assert_eq!(receipt.streak.best_streak, 1);
    assert!(receipt.streak.incremented);
    assert!(receipt.violations_reset);

    // One genesis delta, one system_state entity, skeleton fully populated.
    let deltas = store.load_deltas().unwrap();
    assert_eq!(deltas.len(), 1);
    assert!(deltas[0].is_genesis());
    let system = ClosureEngine::load_system(&store).unwrap().unwrap();
    assert_eq!(system.state["mode"], "SCALE");
    assert_eq!(system.state["metrics"]["closed_loops_total"], 1);
    assert_eq!(system.state["enforcement"]["violations_count"], 0);
    assert_eq!(system.state["enforcement"]["closure_log"][0]["loop_id"], "L1");
    assert_eq!(system.state["streak"]["streak_days"], 1);

    let registry = engine.registry().unwrap();
    assert_eq!(registry.closures.len(), 1);
    assert_eq!(registry.stats.total_closures, 1);
}

#[test]
fn duplicate_loop_id_is_rejected_without_side_effects() {
    // Closing the same loop twice yields AlreadyClosed and leaves both
    // the state and the registry untouched.
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();

    close(&engine, &mut store, "L1");
    let head_before = ClosureEngine::load_system(&store).unwrap().unwrap();
    let err = engine
        .close_loop(
            &mut store,
            &ClosureRequest {
                loop_id: Some("L1".to_string()),
                title: None,
                outcome: ClosureOutcome::Closed,
                source: "user".to_string(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, LawError::AlreadyClosed { .. }));

    let head_after = ClosureEngine::load_system(&store).unwrap().unwrap();
    assert_eq!(head_before.entity.state_hash, head_after.entity.state_hash);
    assert_eq!(engine.registry().unwrap().closures.len(), 1);
    assert_eq!(store.load_deltas().unwrap().len(), 1);
}

#[test]
fn closure_is_one_atomic_delta() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();

    close(&engine, &mut store, "L1");
    let before = store.load_deltas().unwrap().len();
    close(&engine, &mut store, "L2");
    let deltas = store.load_deltas().unwrap();
    // Exactly one delta per closure, carrying every patch together.
    assert_eq!(deltas.len(), before + 1);
    let last = deltas.last().unwrap();
    let paths: Vec<&str> = last.patches.iter().map(|p| p.path.as_str()).collect();
    assert!(paths.contains(&"/metrics/closure_ratio"));
    assert!(paths.contains(&"/enforcement/violations_count"));
    assert!(paths.iter().any(|p| p.starts_with("/enforcement/closure_log/")));
}

#[test]
fn streak_increments_once_per_day_and_tracks_best() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), Arc::clone(&clock));
    let mut store = MemoryStore::new();

    let first = close(&engine, &mut store, "L1");
    assert_eq!(first.streak.streak_days, 1);

    // Second closure on the same day: no increment.
    let second = close(&engine, &mut store, "L2");
    assert!(!second.streak.incremented);
    assert_eq!(second.streak.streak_days, 1);

    // Next day: increments again, best follows.
    clock.advance(DAY);
    let third = close(&engine, &mut store, "L3");
    assert!(third.streak.incremented);
    assert_eq!(third.streak.streak_days, 2);
    assert_eq!(third.streak.best_streak, 2);
}

#[test]
fn day_end_resets_streak_only_without_eligible_closure() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), Arc::clone(&clock));
    let mut store = MemoryStore::new();

    close(&engine, &mut store, "L1");
    // Same day: streak survives the sweep.
    let report = engine.day_end(&mut store).unwrap();
    assert!(!report.streak_reset);

    // A day with no closures: the sweep resets.
    clock.advance(DAY);
    let report = engine.day_end(&mut store).unwrap();
    assert!(report.streak_reset);
    assert_eq!(engine.registry().unwrap().stats.streak_days, 0);
    let system = ClosureEngine::load_system(&store).unwrap().unwrap();
    assert_eq!(system.state["streak"]["streak_days"], 0);
}

#[test]
fn ratio_uses_open_loop_signal() {
    // Two open loops remain after closing one of three: ratio = 1/(2+1).
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();
    engine
        .save_open_loops(&[
            LoopRecord {
                loop_id: "L1".to_string(),
                title: None,
                opened_at: Some(T0),
                closed_at: None,
            },
            LoopRecord {
                loop_id: "L2".to_string(),
                title: None,
                opened_at: Some(T0),
                closed_at: None,
            },
            LoopRecord {
                loop_id: "L3".to_string(),
                title: None,
                opened_at: Some(T0),
                closed_at: None,
            },
        ])
        .unwrap();

    let receipt = close(&engine, &mut store, "L1");
    assert_eq!(receipt.metrics.open_loops, 2);
    assert!((receipt.metrics.closure_ratio - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(receipt.mode, Mode::Closure);
    assert!(!receipt.build_allowed);

    // Physical removal moved the loop.
    assert!(receipt.physical_closure.removed);
    assert_eq!(engine.open_loops().unwrap().len(), 2);
    assert_eq!(engine.closed_loops().unwrap().len(), 1);
}

#[test]
fn violations_escalate_and_closures_reset_them() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();

    for i in 0..3 {
        let receipt = engine
            .violation(&mut store, &format!("skipped ritual {i}"), None)
            .unwrap();
        if i < 2 {
            assert_eq!(receipt.enforcement_level, "normal");
        } else {
            assert_eq!(receipt.enforcement_level, "warning");
        }
    }
    let err = engine.violation(&mut store, "  ", None).unwrap_err();
    assert!(matches!(err, LawError::ActionRequired));

    close(&engine, &mut store, "L1");
    let system = ClosureEngine::load_system(&store).unwrap().unwrap();
    assert_eq!(system.state["enforcement"]["violations_count"], 0);
}

#[test]
fn put_signals_then_recalc_routes_through_lut() {
    // Force CLOSURE via signals, then raise the ratio and watch
    // the LUT flip the mode.
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();

    engine
        .put_signals(
            &mut store,
            &PutSignals {
                mode: Some("CLOSURE".to_string()),
                sleep_hours: Some(8.0),
                open_loops: Some(0),
                leverage_balance: Some(0.0),
                streak_days: None,
            },
        )
        .unwrap();
    let system = ClosureEngine::load_system(&store).unwrap().unwrap();
    assert_eq!(system.state["mode"], "CLOSURE");
    assert_eq!(system.state["build_allowed"], false);

    // One closure with no open loops → ratio 1.0 → SCALE.
    let receipt = close(&engine, &mut store, "L1");
    assert_eq!(receipt.mode, Mode::Scale);
    assert!(receipt.build_allowed);

    // Recalc is now a no-op: the LUT agrees with the recorded mode.
    let recalc = engine.recalc_mode(&mut store).unwrap();
    assert!(!recalc.changed);
    assert_eq!(recalc.mode, Mode::Scale);
}

#[test]
fn unknown_mode_tag_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();
    let err = engine
        .put_signals(
            &mut store,
            &PutSignals {
                mode: Some("PARTY".to_string()),
                ..PutSignals::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, LawError::UnknownMode { .. }));
}

#[test]
fn archive_requires_an_identifier_and_reuses_closure_path() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(T0));
    let engine = engine(dir.path(), clock);
    let mut store = MemoryStore::new();

    assert!(matches!(
        engine.archive(&mut store, None, None, None),
        Err(LawError::MissingIdentifier)
    ));

    engine
        .save_open_loops(&[LoopRecord {
            loop_id: "L9".to_string(),
            title: Some("stale experiment".to_string()),
            opened_at: Some(T0),
            closed_at: None,
        }])
        .unwrap();
    let receipt = engine
        .archive(&mut store, None, Some("stale experiment"), Some("obsolete"))
        .unwrap();
    assert_eq!(receipt.closure.outcome, ClosureOutcome::Archived);
    assert_eq!(receipt.closure.loop_id.as_deref(), Some("L9"));
    assert!(engine.open_loops().unwrap().is_empty());
}
