//! `rca-agents`: run RCA scenarios and answer file-transport signals
//!
//! # Usage
//!
//! ```bash
//! # Drive a scenario with the in-process worker
//! rca-agents run scenarios/ptp.toml
//!
//! # Same scenario over the file signal transport with an embedded responder
//! rca-agents run scenarios/ptp.toml --transport file --parallel 4
//!
//! # Answer signals written by another process
//! rca-agents respond .rca/work --worker keyword --scenario scenarios/ptp.toml
//!
//! # Print the heuristic graph
//! rca-agents graph --json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rca_agents::workers::build_worker;
use rca_agents::{pipeline_graph, run_scenario, AgentsConfig, Responder, Scenario, Transport, WorkerKind};
use rca_coordination::pipeline::heuristics::EdgeKind;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Coordination config file (TOML); RCA_* environment variables still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log level to debug (RUST_LOG still wins)
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive every case in a scenario to completion
    Run {
        /// Scenario file (.toml or .json)
        scenario: PathBuf,

        #[arg(long, value_enum, default_value_t = Transport::Inline)]
        transport: Transport,

        #[arg(long, value_enum)]
        worker: Option<WorkerKind>,

        /// Cases driven concurrently (overrides RCA_PARALLEL_CASES)
        #[arg(long)]
        parallel: Option<usize>,

        #[arg(long)]
        case_dir: Option<PathBuf>,

        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Print the run report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Watch for signal.json files and answer them until interrupted
    Respond {
        /// Directory to watch (defaults to the file transport work dir)
        watch_dir: Option<PathBuf>,

        /// Scenario supplying canned artifacts or failure text
        #[arg(long)]
        scenario: Option<PathBuf>,

        #[arg(long, value_enum)]
        worker: Option<WorkerKind>,

        #[arg(long)]
        poll_ms: Option<u64>,

        /// Scan once and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Print the heuristic graph edges
    Graph {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let mut config = AgentsConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            scenario,
            transport,
            worker,
            parallel,
            case_dir,
            work_dir,
            json,
        } => {
            if let Some(worker) = worker {
                config.worker = worker;
            }
            if let Some(dir) = case_dir {
                config.coordination.case_dir = dir;
            }
            if let Some(dir) = work_dir {
                config.coordination.file.work_dir = dir;
            }
            let parallel = parallel.unwrap_or(config.coordination.session.parallel_cases);
            let scenario = Scenario::load(&scenario)?;

            let run = run_scenario(&config, &scenario, transport, parallel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run.report)?);
            } else {
                for case in &run.report.cases {
                    let path: Vec<&str> = case.path.iter().map(|s| s.wire_name()).collect();
                    match &case.error {
                        None => println!("{:<12} {:<6} {}", case.case_id, case.status, path.join(" -> ")),
                        Some(e) => println!("{:<12} FAILED {}", case.case_id, e),
                    }
                }
                println!("{}", run.report.summary());
                println!(
                    "dispatches: {} ({} failed), {} ms",
                    run.tracking.dispatches, run.tracking.failures, run.tracking.wall_clock_ms
                );
            }
            if run.report.failed() > 0 {
                anyhow::bail!("{} of {} cases failed", run.report.failed(), run.report.cases.len());
            }
        }

        Command::Respond {
            watch_dir,
            scenario,
            worker,
            poll_ms,
            once,
        } => {
            if let Some(worker) = worker {
                config.worker = worker;
            }
            if let Some(ms) = poll_ms {
                config.responder_poll_ms = ms.max(1);
            }
            if let Some(dir) = watch_dir {
                config.watch_dir = Some(dir);
            }
            let scenario = match scenario {
                Some(path) => Scenario::load(&path)?,
                None => Scenario::default(),
            };
            let worker = build_worker(config.worker, &scenario)?;
            let mut responder = Responder::new(config.watch_dir(), worker, config.responder_poll());

            if once {
                let responses = responder.scan_once()?;
                info!(responses = responses.len(), "Scan complete");
                return Ok(());
            }

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                }
            });
            responder.run(cancel).await?;
        }

        Command::Graph { json } => {
            let graph = pipeline_graph(&config).context("building heuristic graph")?;
            let edges = graph.describe();
            if json {
                println!("{}", serde_json::to_string_pretty(&edges)?);
            } else {
                for edge in &edges {
                    let kind = match &edge.kind {
                        EdgeKind::Normal => String::new(),
                        EdgeKind::Shortcut => "shortcut".to_string(),
                        EdgeKind::Loop(key) => format!("loop:{key}"),
                    };
                    println!(
                        "{:<5} {:<16} -> {:<16} {:<28} {}",
                        edge.id,
                        edge.from.wire_name(),
                        edge.to.wire_name(),
                        edge.name,
                        kind
                    );
                }
            }
        }
    }

    Ok(())
}
