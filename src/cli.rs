//! CLI: subcommands for running the engine and operating it from the
//! shell. A `clap::Parser` root with a `Commands` enum and a
//! `handle_cli() -> Option<i32>` "handled, exit early" convention covering
//! the small set of operator actions this engine needs: serve, config,
//! dlq replay, health, demo seed.

use std::io::Write;

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};

/// Local-only telemetry processing engine for AI-coding assistants.
#[derive(Parser)]
#[command(name = "telemetry-engine")]
#[command(version = VERSION)]
#[command(about = "Durable queue + two-track ingest/derivation pipeline for IDE telemetry", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: starts the supervisor and the HTTP intake/read surface.
    Serve,

    /// Manage configuration.
    Config {
        /// Show effective configuration (env > file > defaults).
        #[arg(long)]
        show: bool,

        /// Show the config file path.
        #[arg(long)]
        path: bool,
    },

    /// Operator actions against the dead-letter queue.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Report liveness/readiness without starting the HTTP surface.
    Health,

    /// Seed the queue with a synthetic session for local dashboard testing.
    Demo {
        /// Number of synthetic sessions to generate.
        #[arg(long, default_value_t = 1)]
        sessions: usize,
    },
}

#[derive(Subcommand)]
pub enum DlqAction {
    /// Re-enqueue DLQ entries matching a reason substring (all entries if omitted).
    Replay {
        #[arg(long)]
        reason_contains: Option<String>,
    },
}

/// Parses `argv` and dispatches everything except `serve`. Returns `Some`
/// when a command was fully handled (caller should exit with that code);
/// `None` means "start the engine normally", which is also what a bare
/// invocation with no subcommand does.
pub fn handle_cli() -> Option<i32> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Commands::Serve) => None,
        Some(Commands::Config { show, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else {
                println!("Usage: telemetry-engine config [--show|--path]");
            }
            Some(0)
        }
        Some(Commands::Dlq { action }) => Some(handle_dlq(action)),
        Some(Commands::Health) => Some(handle_health()),
        Some(Commands::Demo { sessions }) => Some(handle_demo(sessions)),
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("error: could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();
    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("data_dir = {:?}", config.data_dir.display().to_string());
    println!("bind_addr = {:?}", config.bind_addr);
    println!();
    println!("[queue]");
    println!("max_length = {}", config.queue.max_length);
    println!("visibility_timeout_ms = {}", config.queue.visibility_timeout_ms);
    println!("max_retries = {}", config.queue.max_retries);
    println!();
    println!("[ingest]");
    println!("batch_size = {}", config.ingest.batch_size);
    println!("batch_timeout_ms = {}", config.ingest.batch_timeout_ms);
    println!("high_watermark_ms = {}", config.ingest.high_watermark_ms);
    println!();
    println!("[slow_path]");
    println!("worker_count = {}", config.slow_path.worker_count);
    println!("partitioning = {:?}", config.slow_path.partitioning);
    println!();
    println!("[composite]");
    println!("interval_s = {}", config.composite.interval_s);
    println!("lock_ttl_s = {}", config.composite.lock_ttl_s);
    println!();
    println!("[retention]");
    println!("raw_hours = {}", config.retention.raw_hours);
    println!("per_minute_days = {}", config.retention.per_minute_days);
    println!("per_hour_years = {}", config.retention.per_hour_years);

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
    std::io::stdout().flush().ok();
}

fn handle_dlq(action: DlqAction) -> i32 {
    let config = Config::from_env();
    let supervisor = match crate::supervisor::Supervisor::start(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to start engine: {e}");
            return 1;
        }
    };
    match action {
        DlqAction::Replay { reason_contains } => {
            let filter = crate::supervisor::DlqReplayFilter {
                reason_contains,
                platform: None,
            };
            match supervisor.replay_dlq(filter) {
                Ok(n) => {
                    println!("replayed {n} entries");
                    0
                }
                Err(e) => {
                    eprintln!("error: replay failed: {e}");
                    1
                }
            }
        }
    }
}

fn handle_health() -> i32 {
    let config = Config::from_env();
    let supervisor = match crate::supervisor::Supervisor::start(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to start engine: {e}");
            return 1;
        }
    };
    // Give the fast-path thread a moment to touch its heartbeat so a
    // cold-started health check doesn't report a false negative.
    std::thread::sleep(std::time::Duration::from_millis(50));
    let report = supervisor.health();
    println!("live:  {}", report.live);
    println!("ready: {}", report.ready);
    println!("pending fastpath: {}", report.events_pending_fastpath);
    println!("pending slowpath: {}", report.events_pending_slowpath);
    println!("dlq depth: {}", report.dlq_depth);
    if report.ready {
        0
    } else {
        1
    }
}

fn handle_demo(sessions: usize) -> i32 {
    let config = Config::from_env();
    let supervisor = match crate::supervisor::Supervisor::start(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to start engine: {e}");
            return 1;
        }
    };
    match crate::demo::seed(&supervisor, sessions) {
        Ok(n) => {
            println!("seeded {n} synthetic events across {sessions} session(s)");
            // Give the fast/slow paths a moment to drain before exiting so
            // the seeded data is actually visible to the next query.
            std::thread::sleep(std::time::Duration::from_millis(500));
            0
        }
        Err(e) => {
            eprintln!("error: demo seeding failed: {e}");
            1
        }
    }
}
