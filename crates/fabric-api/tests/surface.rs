// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The public operation surface, end to end: state, law, work, tasks,
//! timeline, stream, and two-node sync.

use fabric_api::{
    governance_daemon, ApiError, CloseLoopInput, CompleteInput, FabricConfig, KernelContext,
    StateEvent, StatePut, TaskInput, TaskUpdate,
};
use fabric_kernel::{FixedClock, SequentialIds};
use fabric_timeline::TimelineQuery;
use fabric_work::{JobOutcome, JobType, WorkRequest};
use serde_json::json;
use std::sync::Arc;

const T0: u64 = 1_700_000_000_000;

fn context(dir: &std::path::Path, node_id: &str) -> Arc<KernelContext> {
    let mut config = FabricConfig::new(dir);
    config.node_id = node_id.to_string();
    KernelContext::open_with_ports(
        config,
        Arc::new(FixedClock::at(T0)),
        Arc::new(SequentialIds::default()),
    )
    .unwrap()
}

fn work_request(title: &str) -> WorkRequest {
    WorkRequest {
        job_id: Some(title.to_string()),
        job_type: JobType::Ai,
        title: title.to_string(),
        agent: None,
        weight: 1,
        depends_on: Vec::new(),
        timeout_ms: None,
        metadata: None,
        closure_work: false,
    }
}

#[test]
fn health_reports_version_and_time() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");
    let health = ctx.health();
    assert_eq!(health["ok"], true);
    assert_eq!(health["ts"], T0);
    assert!(health["version"].is_string());
}

#[test]
fn genesis_closure_flows_through_the_surface() {
    // close_loop with no prior system_state materializes the skeleton.
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");

    let receipt = ctx
        .law_close_loop(&CloseLoopInput {
            loop_id: Some("L1".to_string()),
            ..CloseLoopInput::default()
        })
        .unwrap();
    assert_eq!(receipt["mode"], "SCALE");
    assert_eq!(receipt["build_allowed"], true);
    assert_eq!(receipt["streak"]["streak_days"], 1);
    assert_eq!(receipt["streak"]["best_streak"], 1);
    assert_eq!(receipt["metrics"]["closure_ratio"], 1.0);

    let unified = ctx.state_get_unified();
    assert_eq!(unified["mode"], "SCALE");
    assert_eq!(unified["total_closures"], 1);
    assert_eq!(unified["closures_today"], 1);
    assert_eq!(unified["errors"], json!([]));

    // The duplicate is a 409 with a stable reason.
    let err = ctx
        .law_close_loop(&CloseLoopInput {
            loop_id: Some("L1".to_string()),
            ..CloseLoopInput::default()
        })
        .unwrap_err();
    assert_eq!(err.status, 409);
    assert_eq!(err.reason, "already_closed");
    assert_eq!(ctx.state_get_unified()["total_closures"], 1);
}

#[test]
fn admission_then_completion_advances_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");

    // Fresh node: CLOSURE denies.
    let denied = ctx.work_request(&work_request("early")).unwrap();
    assert_eq!(denied["status"], "DENIED");
    assert_eq!(denied["message"], "Must close loops first");

    ctx.law_close_loop(&CloseLoopInput::default()).unwrap();

    let approved = ctx.work_request(&work_request("J1")).unwrap();
    assert_eq!(approved["status"], "APPROVED");

    let mut j2 = work_request("J2");
    j2.depends_on = vec!["J1".to_string()];
    let queued = ctx.work_request(&j2).unwrap();
    assert_eq!(queued["status"], "QUEUED");
    assert_eq!(queued["blocked_by"], json!(["J1"]));

    let completed = ctx
        .work_complete(&CompleteInput {
            job_id: "J1".to_string(),
            outcome: JobOutcome::Completed,
            result: None,
            error: None,
            metrics: None,
        })
        .unwrap();
    assert_eq!(completed["freed_slot"], true);
    assert_eq!(completed["queue_advanced"], true);
    assert_eq!(completed["next_job_started"], "J2");
    assert_eq!(completed["closure_count"], 1);

    let status = ctx.work_status().unwrap();
    assert_eq!(status["active"].as_array().unwrap().len(), 1);
    assert_eq!(status["active"][0]["job_id"], "J2");
    assert!(status["mode"].is_string());

    let history = ctx.work_history().unwrap();
    assert_eq!(history["stats"]["total_completed"], 1);
}

#[test]
fn unknown_job_completion_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");
    let err = ctx
        .work_complete(&CompleteInput {
            job_id: "ghost".to_string(),
            outcome: JobOutcome::Completed,
            result: None,
            error: None,
            metrics: None,
        })
        .unwrap_err();
    assert_eq!(err.status, 404);
}

#[test]
fn tasks_crud_keeps_history() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");

    let created = ctx
        .tasks_create(&TaskInput {
            title: "write spec".to_string(),
            status: None,
            notes: None,
            tags: vec!["deep".to_string()],
        })
        .unwrap();
    let task_id = created["task_id"].as_str().unwrap().to_string();
    assert_eq!(created["state"]["status"], "OPEN");
    assert_eq!(created["version"], 1);

    let updated = ctx
        .tasks_update(
            &task_id,
            &TaskUpdate {
                status: Some("DOING".to_string()),
                ..TaskUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["state"]["status"], "DOING");

    let archived = ctx.tasks_archive(&task_id).unwrap();
    assert_eq!(archived["state"]["status"], "ARCHIVED");
    assert_eq!(archived["version"], 3);

    let listed = ctx.tasks_list().unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    assert!(matches!(
        ctx.tasks_get("task-ffffffffffffffff"),
        Err(ApiError { status: 404, .. })
    ));
}

#[test]
fn state_put_and_unified_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");

    ctx.state_put(&StatePut {
        mode: Some("BUILD".to_string()),
        sleep_hours: Some(8.0),
        open_loops: Some(2),
        leverage_balance: Some(3.0),
        streak_days: None,
    })
    .unwrap();

    let unified = ctx.state_get_unified();
    assert_eq!(unified["mode"], "BUILD");
    assert_eq!(unified["build_allowed"], true);
    assert_eq!(unified["system_state"]["signals"]["sleep_hours"], 8.0);

    let err = ctx
        .state_put(&StatePut {
            mode: Some("PARTY".to_string()),
            ..StatePut::default()
        })
        .unwrap_err();
    assert_eq!(err.status, 400);
}

#[test]
fn timeline_records_surface_activity() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");
    ctx.law_close_loop(&CloseLoopInput::default()).unwrap();
    ctx.tasks_create(&TaskInput {
        title: "t".to_string(),
        status: None,
        notes: None,
        tags: Vec::new(),
    })
    .unwrap();

    let closures = ctx
        .timeline_query(&TimelineQuery {
            event_type: Some("closure".to_string()),
            ..TimelineQuery::default()
        })
        .unwrap();
    assert_eq!(closures.as_array().unwrap().len(), 1);

    let stats = ctx.timeline_stats().unwrap();
    assert_eq!(stats["by_type"]["task_created"], 1);

    let day = ctx.timeline_day("2023-11-14").unwrap();
    assert!(!day.as_array().unwrap().is_empty());
    assert!(ctx.timeline_day("nonsense").is_err());
}

#[test]
fn stream_emits_unified_and_delta_events() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");
    let mut stream = ctx.subscribe();

    ctx.tasks_create(&TaskInput {
        title: "t".to_string(),
        status: None,
        notes: None,
        tags: Vec::new(),
    })
    .unwrap();
    ctx.law_close_loop(&CloseLoopInput::default()).unwrap();

    let mut saw_delta = false;
    let mut saw_unified = false;
    while let Ok(event) = stream.try_recv() {
        match event {
            StateEvent::DeltaCreated { .. } => saw_delta = true,
            StateEvent::UnifiedState { .. } => saw_unified = true,
        }
    }
    assert!(saw_delta);
    assert!(saw_unified);
}

#[test]
fn ingest_cognitive_updates_signals_and_mode() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");
    ctx.law_close_loop(&CloseLoopInput::default()).unwrap();

    let receipt = ctx
        .ingest_cognitive(&json!({"open_loops": 4, "sleep_hours": 7.5}))
        .unwrap();
    assert_eq!(receipt["open_loops"], 4);
    assert!(receipt["mode"].is_string());

    assert!(ctx.ingest_cognitive(&json!("not an object")).is_err());
}

#[test]
fn daemon_runs_manual_jobs_through_the_lane() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), "node-test");
    let daemon = governance_daemon(&ctx);
    ctx.attach_daemon(daemon);

    ctx.daemon_run("heartbeat").unwrap();
    let status = ctx.daemon_status().unwrap();
    assert_eq!(status["jobs"]["heartbeat"]["runs"], 1);

    let err = ctx.daemon_run("work_queue_sweep").unwrap_err();
    assert_eq!(err.status, 400);
}

#[test]
fn two_contexts_converge_over_the_sync_surface() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = context(dir_a.path(), "node-a");
    let b = context(dir_b.path(), "node-b");

    a.tasks_create(&TaskInput {
        title: "shared".to_string(),
        status: None,
        notes: None,
        tags: Vec::new(),
    })
    .unwrap();
    a.law_close_loop(&CloseLoopInput::default()).unwrap();

    // Pump packets between the two surfaces until quiet.
    let mut to_b = vec![a.sync_begin("node-b")];
    let mut to_a: Vec<fabric_sync::Packet> = Vec::new();
    for _round in 0..32 {
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        let mut next_to_a = Vec::new();
        for packet in to_b.drain(..) {
            next_to_a.extend(b.sync_receive("node-a", &packet).unwrap());
        }
        for packet in to_a.drain(..) {
            to_b.extend(a.sync_receive("node-b", &packet).unwrap());
        }
        to_a = next_to_a;
    }

    let unified_a = a.state_get_unified();
    let unified_b = b.state_get_unified();
    assert_eq!(unified_a["mode"], unified_b["mode"]);
    assert_eq!(
        b.tasks_list().unwrap().as_array().unwrap().len(),
        1,
        "task entity replicated"
    );
}
