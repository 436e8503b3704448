// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Delta Fabric daemon (fabricd).
//!
//! A thin HTTP shell over the fabric kernel: every route maps 1:1 onto an
//! operation of the transport-agnostic API surface, and the governance
//! daemon runs on the same runtime. The shell owns no logic — swap it for
//! any other transport and the engine behaves identically.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use fabric_api::{
    governance_daemon, ApiError, CloseLoopInput, CompleteInput, FabricConfig, KernelContext,
    StatePut, TaskInput, TaskUpdate,
};
use fabric_timeline::TimelineQuery;
use fabric_work::WorkRequest;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Data directory for durable artifacts (overrides DELTA_DATA_DIR)
    #[clap(short, long)]
    data_dir: Option<String>,

    /// Port for the HTTP API
    #[clap(short, long, default_value_t = 4600)]
    api_port: u16,

    /// Node id advertised to sync peers (random when omitted)
    #[clap(short, long)]
    node_id: Option<String>,
}

type Ctx = Arc<KernelContext>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut config = match &args.data_dir {
        Some(dir) => FabricConfig::new(dir),
        None => FabricConfig::from_env(),
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    info!(data_dir = %config.data_dir.display(), "starting fabricd");

    let context = KernelContext::open(config)?;
    let daemon = governance_daemon(&context);
    context.attach_daemon(daemon.clone());
    let _handles = daemon.spawn_all();

    let app = Router::new()
        .route("/health", get(health))
        .route("/state/unified", get(state_unified))
        .route("/state/put", post(state_put))
        .route("/state/stream", get(state_stream))
        .route("/tasks", get(tasks_list).post(tasks_create))
        .route("/tasks/:id", get(tasks_get).post(tasks_update))
        .route("/tasks/:id/archive", post(tasks_archive))
        .route("/law/close-loop", post(law_close_loop))
        .route("/law/acknowledge", post(law_acknowledge))
        .route("/law/archive", post(law_archive))
        .route("/law/refresh", post(law_refresh))
        .route("/law/violation", post(law_violation))
        .route("/law/override", post(law_override))
        .route("/work/request", post(work_request))
        .route("/work/complete", post(work_complete))
        .route("/work/cancel", post(work_cancel))
        .route("/work/status", get(work_status))
        .route("/work/history", get(work_history))
        .route("/timeline", get(timeline_query))
        .route("/timeline/stats", get(timeline_stats))
        .route("/timeline/day/:date", get(timeline_day))
        .route("/daemon/status", get(daemon_status))
        .route("/daemon/run/:job", post(daemon_run))
        .route("/ingest/cognitive", post(ingest_cognitive))
        .route("/sync/:peer", post(sync_receive))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(Arc::clone(&context));

    let addr = format!("0.0.0.0:{}", args.api_port).parse::<std::net::SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

struct Failure(ApiError);

impl IntoResponse for Failure {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::to_value(&self.0).unwrap_or(Value::Null))).into_response()
    }
}

impl From<ApiError> for Failure {
    fn from(e: ApiError) -> Self {
        Failure(e)
    }
}

type Reply = Result<Json<Value>, Failure>;

async fn health(State(ctx): State<Ctx>) -> Json<Value> {
    Json(ctx.health())
}

async fn state_unified(State(ctx): State<Ctx>) -> Json<Value> {
    Json(ctx.state_get_unified())
}

async fn state_put(State(ctx): State<Ctx>, Json(put): Json<StatePut>) -> Reply {
    Ok(Json(ctx.state_put(&put)?))
}

/// Long-poll stream shim: each request resolves with the next event.
/// Disconnecting cancels the wait cleanly.
async fn state_stream(State(ctx): State<Ctx>) -> Reply {
    let mut stream = ctx.subscribe();
    match stream.recv().await {
        Ok(event) => Ok(Json(
            serde_json::to_value(&event).unwrap_or(Value::Null),
        )),
        Err(_) => Ok(Json(json!({ "event": "lagged" }))),
    }
}

async fn tasks_list(State(ctx): State<Ctx>) -> Reply {
    Ok(Json(ctx.tasks_list()?))
}

async fn tasks_create(State(ctx): State<Ctx>, Json(input): Json<TaskInput>) -> Reply {
    Ok(Json(ctx.tasks_create(&input)?))
}

async fn tasks_get(State(ctx): State<Ctx>, Path(id): Path<String>) -> Reply {
    Ok(Json(ctx.tasks_get(&id)?))
}

async fn tasks_update(
    State(ctx): State<Ctx>,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Reply {
    Ok(Json(ctx.tasks_update(&id, &update)?))
}

async fn tasks_archive(State(ctx): State<Ctx>, Path(id): Path<String>) -> Reply {
    Ok(Json(ctx.tasks_archive(&id)?))
}

async fn law_close_loop(State(ctx): State<Ctx>, Json(input): Json<CloseLoopInput>) -> Reply {
    Ok(Json(ctx.law_close_loop(&input)?))
}

#[derive(Deserialize)]
struct AcknowledgeBody {
    order: String,
}

async fn law_acknowledge(State(ctx): State<Ctx>, Json(body): Json<AcknowledgeBody>) -> Reply {
    Ok(Json(ctx.law_acknowledge(&body.order)?))
}

#[derive(Deserialize)]
struct ArchiveBody {
    #[serde(default)]
    loop_id: Option<String>,
    #[serde(default)]
    loop_title: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

async fn law_archive(State(ctx): State<Ctx>, Json(body): Json<ArchiveBody>) -> Reply {
    Ok(Json(ctx.law_archive(
        body.loop_id.as_deref(),
        body.loop_title.as_deref(),
        body.reason.as_deref(),
    )?))
}

async fn law_refresh(State(ctx): State<Ctx>) -> Reply {
    Ok(Json(ctx.law_refresh()?))
}

#[derive(Deserialize)]
struct ViolationBody {
    action: String,
    #[serde(default)]
    context: Option<Value>,
}

async fn law_violation(State(ctx): State<Ctx>, Json(body): Json<ViolationBody>) -> Reply {
    Ok(Json(ctx.law_violation(&body.action, body.context.as_ref())?))
}

#[derive(Deserialize)]
struct OverrideBody {
    reason: String,
}

async fn law_override(State(ctx): State<Ctx>, Json(body): Json<OverrideBody>) -> Reply {
    Ok(Json(ctx.law_override(&body.reason)?))
}

async fn work_request(State(ctx): State<Ctx>, Json(request): Json<WorkRequest>) -> Reply {
    Ok(Json(ctx.work_request(&request)?))
}

async fn work_complete(State(ctx): State<Ctx>, Json(input): Json<CompleteInput>) -> Reply {
    Ok(Json(ctx.work_complete(&input)?))
}

#[derive(Deserialize)]
struct CancelBody {
    job_id: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn work_cancel(State(ctx): State<Ctx>, Json(body): Json<CancelBody>) -> Reply {
    Ok(Json(ctx.work_cancel(&body.job_id, body.reason.as_deref())?))
}

async fn work_status(State(ctx): State<Ctx>) -> Reply {
    Ok(Json(ctx.work_status()?))
}

async fn work_history(State(ctx): State<Ctx>) -> Reply {
    Ok(Json(ctx.work_history()?))
}

#[derive(Deserialize)]
struct TimelineParams {
    #[serde(default)]
    from: Option<u64>,
    #[serde(default)]
    to: Option<u64>,
    #[serde(default, rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn timeline_query(State(ctx): State<Ctx>, Query(params): Query<TimelineParams>) -> Reply {
    let query = TimelineQuery {
        from: params.from,
        to: params.to,
        event_type: params.event_type,
        source: params.source,
        limit: params.limit,
    };
    Ok(Json(ctx.timeline_query(&query)?))
}

async fn timeline_stats(State(ctx): State<Ctx>) -> Reply {
    Ok(Json(ctx.timeline_stats()?))
}

async fn timeline_day(State(ctx): State<Ctx>, Path(date): Path<String>) -> Reply {
    Ok(Json(ctx.timeline_day(&date)?))
}

async fn daemon_status(State(ctx): State<Ctx>) -> Reply {
    Ok(Json(ctx.daemon_status()?))
}

async fn daemon_run(State(ctx): State<Ctx>, Path(job): Path<String>) -> Reply {
    Ok(Json(ctx.daemon_run(&job)?))
}

#[derive(Deserialize)]
struct IngestBody {
    cognitive: Value,
    #[serde(default)]
    #[allow(dead_code)]
    directive: Option<Value>,
}

async fn ingest_cognitive(State(ctx): State<Ctx>, Json(body): Json<IngestBody>) -> Reply {
    Ok(Json(ctx.ingest_cognitive(&body.cognitive)?))
}

async fn sync_receive(
    State(ctx): State<Ctx>,
    Path(peer): Path<String>,
    Json(packet): Json<fabric_sync::Packet>,
) -> Reply {
    let replies = ctx.sync_receive(&peer, &packet)?;
    Ok(Json(serde_json::to_value(replies).unwrap_or(Value::Null)))
}
