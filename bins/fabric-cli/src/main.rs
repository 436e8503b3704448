// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Delta Fabric CLI.
//!
//! Operates directly on a local data directory through the same API surface
//! fabricd exposes over HTTP. Exit codes: 0 success, 1 user error,
//! 2 protocol/validation error, 3 I/O error.

use clap::{Parser, Subcommand};
use fabric_api::{
    ApiError, CloseLoopInput, CompleteInput, FabricConfig, KernelContext, StatePut, TaskInput,
    TaskUpdate,
};
use fabric_timeline::TimelineQuery;
use fabric_work::{JobOutcome, JobType, WorkRequest};
use serde_json::Value;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Delta Fabric CLI", long_about = None)]
struct Args {
    /// Data directory (overrides DELTA_DATA_DIR)
    #[clap(short, long)]
    data_dir: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Liveness and version
    Health,
    /// Print the unified state view
    State,
    /// Write signal fields into system_state
    Put {
        /// Mode tag (RECOVER, CLOSE_LOOPS, BUILD, COMPOUND, SCALE,
        /// MAINTENANCE, CLOSURE)
        #[clap(long)]
        mode: Option<String>,
        /// Last night's sleep, hours
        #[clap(long)]
        sleep_hours: Option<f64>,
        /// Open loop count
        #[clap(long)]
        open_loops: Option<u64>,
        /// Leverage balance
        #[clap(long)]
        leverage_balance: Option<f64>,
    },
    /// Close a loop
    Close {
        /// Loop id to retire
        #[clap(long)]
        loop_id: Option<String>,
        /// Human title for the ledger row
        #[clap(long)]
        title: Option<String>,
    },
    /// Archive a loop by id or title
    Archive {
        #[clap(long)]
        loop_id: Option<String>,
        #[clap(long)]
        loop_title: Option<String>,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Record a law violation
    Violation {
        /// The violating action
        action: String,
    },
    /// List tasks
    Tasks,
    /// Create a task
    TaskAdd {
        /// Task title
        title: String,
        /// Ordered tags
        #[clap(long)]
        tag: Vec<String>,
    },
    /// Update a task's status
    TaskStatus {
        /// Task id
        task_id: String,
        /// New status
        status: String,
    },
    /// Request work admission
    WorkRequest {
        /// Job title
        title: String,
        /// human | ai | system
        #[clap(long, default_value = "human")]
        job_type: String,
        /// Slot weight 1-10
        #[clap(long, default_value_t = 1)]
        weight: u64,
        /// Mark as closure work
        #[clap(long)]
        closure_work: bool,
    },
    /// Complete a job
    WorkComplete {
        /// Job id
        job_id: String,
        /// completed | failed | abandoned
        #[clap(long, default_value = "completed")]
        outcome: String,
    },
    /// Show work capacity and queues
    WorkStatus,
    /// Query the timeline
    Timeline {
        /// Event type filter
        #[clap(long)]
        event_type: Option<String>,
        /// Row cap (≤ 100)
        #[clap(long)]
        limit: Option<usize>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
        .init();
    let args = Args::parse();
    match run(args) {
        Ok(value) => {
            match serde_json::to_string_pretty(&value) {
                Ok(rendered) => println!("{rendered}"),
                Err(_) => println!("{value}"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// 1 user error, 2 protocol/validation error, 3 I/O error.
fn exit_code_for(e: &ApiError) -> u8 {
    match e.status {
        404 => 1,
        400 | 409 => 2,
        _ => 3,
    }
}

fn run(args: Args) -> Result<Value, ApiError> {
    let config = match &args.data_dir {
        Some(dir) => FabricConfig::new(dir),
        None => FabricConfig::from_env(),
    };
    let ctx = KernelContext::open(config)?;
    match args.command {
        Command::Health => Ok(ctx.health()),
        Command::State => Ok(ctx.state_get_unified()),
        Command::Put {
            mode,
            sleep_hours,
            open_loops,
            leverage_balance,
        } => ctx.state_put(&StatePut {
            mode,
            sleep_hours,
            open_loops,
            leverage_balance,
            streak_days: None,
        }),
        Command::Close { loop_id, title } => ctx.law_close_loop(&CloseLoopInput {
            loop_id,
            title,
            outcome: None,
            source: Some("user".to_string()),
        }),
        Command::Archive {
            loop_id,
            loop_title,
            reason,
        } => ctx.law_archive(loop_id.as_deref(), loop_title.as_deref(), reason.as_deref()),
        Command::Violation { action } => ctx.law_violation(&action, None),
        Command::Tasks => ctx.tasks_list(),
        Command::TaskAdd { title, tag } => ctx.tasks_create(&TaskInput {
            title,
            status: None,
            notes: None,
            tags: tag,
        }),
        Command::TaskStatus { task_id, status } => ctx.tasks_update(
            &task_id,
            &TaskUpdate {
                status: Some(status),
                ..TaskUpdate::default()
            },
        ),
        Command::WorkRequest {
            title,
            job_type,
            weight,
            closure_work,
        } => {
            let job_type = match job_type.as_str() {
                "human" => JobType::Human,
                "ai" => JobType::Ai,
                "system" => JobType::System,
                other => {
                    return Err(ApiError::validation(format!("unknown job type {other:?}")))
                }
            };
            ctx.work_request(&WorkRequest {
                job_id: None,
                job_type,
                title,
                agent: None,
                weight,
                depends_on: Vec::new(),
                timeout_ms: None,
                metadata: None,
                closure_work,
            })
        }
        Command::WorkComplete { job_id, outcome } => {
            let outcome = match outcome.as_str() {
                "completed" => JobOutcome::Completed,
                "failed" => JobOutcome::Failed,
                "abandoned" => JobOutcome::Abandoned,
                other => {
                    return Err(ApiError::validation(format!("unknown outcome {other:?}")))
                }
            };
            ctx.work_complete(&CompleteInput {
                job_id,
                outcome,
                result: None,
                error: None,
                metrics: None,
            })
        }
        Command::WorkStatus => ctx.work_status(),
        Command::Timeline { event_type, limit } => ctx.timeline_query(&TimelineQuery {
            event_type,
            limit,
            ..TimelineQuery::default()
        }),
    }
}
