//! cmdgate: mediate model-suggested shell commands.
//!
//! Subcommands:
//!   - `run`: interactive loop over stdin lines (the default)
//!   - `watch`: serve the trigger directory until Ctrl-C
//!   - `submit`: drop a task into the trigger directory, optionally wait
//!   - `check`: validate a command without running it
//!   - `audit`: query the audit log
//!   - `status`: queue and audit health

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};

use cmdgate::approval::{ApprovalGate, StaticApproval, TerminalApproval};
use cmdgate::audit::{AuditFilter, AuditLog, AuditRecord};
use cmdgate::config::{Config, ExecutionMode};
use cmdgate::logging;
use cmdgate::pipeline::{Outcome, RequestPipeline};
use cmdgate::queue::{self, TriggerQueue};
use cmdgate::reload::ConfigWatcher;

// ─── Arguments ───────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cmdgate", version, about = "Mediate model-suggested shell commands")]
struct Cli {
    /// Configuration overlay file
    #[arg(long, short, default_value = "config.toml", env = "CMDGATE_CONFIG")]
    config: PathBuf,

    /// Deny every approval request instead of prompting
    #[arg(long)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read requests from stdin, one per line
    Run,
    /// Process task files from the trigger directory
    Watch {
        /// Process what is pending and exit
        #[arg(long)]
        once: bool,
    },
    /// Write a request into the trigger directory
    Submit {
        text: String,
        #[arg(long, default_value = "cli")]
        source: String,
        /// Wait up to this many seconds for the result
        #[arg(long)]
        wait: Option<u64>,
        /// Trigger directory (defaults to the configured one)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Validate a command against the policy without running it
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Query the audit log
    Audit {
        #[command(subcommand)]
        query: AuditQuery,
        /// Print JSON instead of a table
        #[arg(long, global = true)]
        json: bool,
    },
    /// Report queue and audit health
    Status,
}

#[derive(Subcommand, Debug)]
enum AuditQuery {
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Executed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Rejected {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Search {
        keyword: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Since {
        hours: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    Stats {
        /// Only count the last N hours
        #[arg(long)]
        hours: Option<i64>,
    },
}

// ─── Startup ─────────────────────────────────────────

fn fatal(msg: impl std::fmt::Display) -> ! {
    error!("{msg}");
    eprintln!("cmdgate: {msg}");
    std::process::exit(1);
}

/// Load configuration and install logging. A malformed file is reported and
/// replaced by defaults until it is fixed.
fn load_config(path: &Path) -> Arc<ConfigWatcher> {
    match ConfigWatcher::load(path) {
        Ok(watcher) => {
            logging::init(&watcher.snapshot().config);
            Arc::new(watcher)
        }
        Err(e) => {
            logging::init(&Config::default_config());
            error!("{e}; continuing with defaults");
            Arc::new(ConfigWatcher::with_defaults(path))
        }
    }
}

fn build_pipeline(watcher: Arc<ConfigWatcher>, non_interactive: bool) -> Arc<RequestPipeline> {
    let path = watcher.snapshot().config.audit_log_path();
    let audit = match AuditLog::open(&path) {
        Ok(a) => Arc::new(a),
        Err(e) => fatal(format!("cannot open audit log: {e}")),
    };
    let gate: Arc<dyn ApprovalGate> = if non_interactive {
        Arc::new(StaticApproval(false))
    } else {
        Arc::new(TerminalApproval)
    };
    Arc::new(RequestPipeline::new(watcher, audit, gate))
}

fn open_audit_read_only(watcher: &ConfigWatcher) -> AuditLog {
    let path = watcher.snapshot().config.audit_log_path();
    AuditLog::open_read_only(&path)
        .unwrap_or_else(|e| fatal(format!("cannot open audit log {}: {e}", path.display())))
}

// ─── Subcommands ─────────────────────────────────────

fn print_outcome(outcome: &Outcome) {
    println!("{outcome}");
    if let Some(result) = outcome.result() {
        if !result.stdout.is_empty() {
            print!("{}", result.stdout);
            if !result.stdout.ends_with('\n') {
                println!();
            }
        }
        if !result.stderr.is_empty() {
            eprint!("{}", result.stderr);
            if !result.stderr.ends_with('\n') {
                eprintln!();
            }
        }
    }
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        eprint!("cmdgate> ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await
    .ok()
    .flatten()
}

async fn run_interactive(pipeline: Arc<RequestPipeline>) {
    info!("interactive mode; type 'exit' to quit");
    while let Some(line) = read_line().await {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit") {
            break;
        }
        let processed = pipeline.process("cli", input).await;
        print_outcome(&processed.outcome);
    }
}

async fn run_watch(watcher: Arc<ConfigWatcher>, non_interactive: bool, once: bool) {
    let triggers = watcher.snapshot().config.triggers.clone();
    let pipeline = build_pipeline(Arc::clone(&watcher), non_interactive);
    let queue = Arc::new(TriggerQueue::from_config(&triggers, pipeline));

    if once {
        match queue.drain().await {
            Ok(n) => info!("processed {n} task(s)"),
            Err(e) => fatal(e),
        }
        return;
    }

    let reload = tokio::spawn(Arc::clone(&watcher).poll(Duration::from_secs(2)));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    if let Err(e) = queue.run(shutdown).await {
        fatal(e);
    }
    reload.abort();
}

async fn run_submit(
    watcher: &ConfigWatcher,
    text: &str,
    source: &str,
    wait: Option<u64>,
    dir: Option<PathBuf>,
) {
    let dir = dir.unwrap_or_else(|| watcher.snapshot().config.watch_dir());
    let task = queue::submit(&dir, text, source).unwrap_or_else(|e| fatal(e));
    println!("{}", task.display());

    let Some(secs) = wait else { return };
    match queue::wait_for_result(&task, Duration::from_secs(secs)).await {
        Ok(Some(report)) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => fatal(e),
        },
        Ok(None) => fatal(format!("no result within {secs}s")),
        Err(e) => fatal(e),
    }
}

fn run_check(watcher: &ConfigWatcher, command: &str) {
    let snapshot = watcher.snapshot();
    let verdict = snapshot.policy.validate(command);
    let output = serde_json::json!({
        "command": command,
        "verdict": verdict.label(),
        "reason": verdict.reason,
        "requires_approval": verdict.ok
            && (snapshot.mode == ExecutionMode::Prompt
                || snapshot.policy.needs_approval(command)),
        "mode": snapshot.mode.as_str(),
    });
    println!("{output:#}");
    if !verdict.ok {
        std::process::exit(1);
    }
}

fn print_records(records: &[AuditRecord], json: bool) {
    if json {
        match serde_json::to_string_pretty(records) {
            Ok(s) => println!("{s}"),
            Err(e) => fatal(e),
        }
        return;
    }
    for r in records {
        println!(
            "{}  {:<20}  {:<24}  {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.event_type.as_str(),
            r.source,
            r.extracted_command.as_deref().unwrap_or(&r.input)
        );
    }
    if records.is_empty() {
        println!("(no matching records)");
    }
}

fn run_audit(watcher: &ConfigWatcher, query: AuditQuery, json: bool) {
    let audit = open_audit_read_only(watcher);
    let filter = match query {
        AuditQuery::Recent { limit } => AuditFilter::recent(limit),
        AuditQuery::Executed { limit } => AuditFilter::executed(limit),
        AuditQuery::Rejected { limit } => AuditFilter::rejected(limit),
        AuditQuery::Search { keyword, limit } => AuditFilter::search(keyword, limit),
        AuditQuery::Since { hours, limit } => AuditFilter::last_hours(hours, limit),
        AuditQuery::Stats { hours } => {
            let since = hours.map(|h| chrono::Utc::now() - chrono::Duration::hours(h));
            let stats = audit.stats(since).unwrap_or_else(|e| fatal(e));
            match serde_json::to_string_pretty(&stats) {
                Ok(s) => println!("{s}"),
                Err(e) => fatal(e),
            }
            return;
        }
    };
    match audit.query(&filter) {
        Ok(records) => print_records(&records, json),
        Err(e) => fatal(e),
    }
}

fn run_status(watcher: &ConfigWatcher) {
    let snapshot = watcher.snapshot();
    let config = &snapshot.config;
    let queue_health = queue::health(&config.watch_dir());
    let healthy = queue_health.healthy;

    let audit_path = config.audit_log_path();
    let audit = match AuditLog::open_read_only(&audit_path) {
        Ok(log) => {
            let since = chrono::Utc::now() - chrono::Duration::hours(24);
            match log.stats(Some(since)) {
                Ok(stats) => serde_json::json!({ "ok": true, "last_24h": stats }),
                Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
            }
        }
        Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
    };

    let output = serde_json::json!({
        "config": watcher.path(),
        "mode": config.settings.execution_mode.as_str(),
        "policy": {
            "whitelist": snapshot.policy.whitelist(),
            "blacklist": snapshot.policy.blacklist(),
            "require_approval_for": snapshot.policy.require_approval_for(),
        },
        "queue": queue_health,
        "audit": audit,
    });
    println!("{output:#}");
    if !healthy {
        std::process::exit(1);
    }
}

// ─── Main ────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let watcher = load_config(&cli.config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let pipeline = build_pipeline(watcher, cli.non_interactive);
            run_interactive(pipeline).await;
        }
        Command::Watch { once } => run_watch(watcher, cli.non_interactive, once).await,
        Command::Submit {
            text,
            source,
            wait,
            dir,
        } => run_submit(&watcher, &text, &source, wait, dir).await,
        Command::Check { command } => run_check(&watcher, &command.join(" ")),
        Command::Audit { query, json } => run_audit(&watcher, query, json),
        Command::Status => run_status(&watcher),
    }
}
