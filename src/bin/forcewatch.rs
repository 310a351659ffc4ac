//! forcewatch CLI
//!
//! Periodic ingestion of controller force dumps, and a small read/annotate surface over the
//! resulting force store.
//!
//! ## Commands
//!
//! - `run`: fetch and reconcile every controller (or one), once or every `--interval` seconds
//! - `ingest <file>`: reconcile a local dump as the complete batch of one scope
//! - `sync-scopes`: drop store rows and cached dumps of scopes no longer configured
//! - `show`, `history`: read records and force episodes
//! - `annotate`: attach reason, operator and ticket to a forced bit

use clap::{Parser, Subcommand};
use forcewatch::{
    commands::{dispatch, Op, OpResult},
    config::{ConfigProvider, PipelineConfig, TomlConfigProvider},
    db::{db_init, DbConnection},
    metadata::SqliteMetadataSource,
    pipeline::{ForcePipeline, RunReport},
    properties::{now_secs, Annotation, Scope},
    transport::MirrorTransport,
    ForceError,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Parser)]
#[command(name = "forcewatch")]
#[command(author, version, about = "Track forced bits on industrial controllers", long_about = None)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "forcewatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch dumps and reconcile them into the force store
    Run {
        /// Only this controller (default: all configured controllers)
        #[arg(long)]
        controller: Option<String>,

        /// Repeat every SECS seconds until Ctrl-C (default: run once)
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,

        /// Local mirror of the controllers' file systems
        #[arg(long)]
        mirror: PathBuf,
    },

    /// Reconcile a local dump file as the complete batch of one scope
    Ingest {
        file: PathBuf,

        #[arg(long)]
        controller: String,

        #[arg(long)]
        resource: String,
    },

    /// Remove stored records and cached dumps of scopes no longer in the configuration
    SyncScopes,

    /// List force records
    Show {
        #[arg(long)]
        controller: String,

        /// Limit to one resource
        #[arg(long)]
        resource: Option<String>,

        /// Only currently active forces
        #[arg(long)]
        active: bool,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the force episodes of one bit
    History {
        #[arg(long)]
        controller: String,

        #[arg(long)]
        resource: String,

        #[arg(long)]
        bit: String,
    },

    /// Attach operator context to a forced bit
    Annotate {
        #[arg(long)]
        controller: String,

        #[arg(long)]
        resource: String,

        #[arg(long)]
        bit: String,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long)]
        forced_by: Option<String>,

        #[arg(long)]
        ticket: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = TomlConfigProvider::new(cli.config.clone()).get_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli.command, config))?;
    Ok(())
}

async fn execute(command: Commands, config: PipelineConfig) -> Result<(), ForceError> {
    let db = DbConnection(db_init(&config.store_path).await?);

    match command {
        Commands::Run {
            controller,
            interval,
            mirror,
        } => {
            let source = SqliteMetadataSource::connect(&config).await?;
            let pipeline =
                ForcePipeline::new(Arc::new(config), db, source, MirrorTransport::new(mirror));

            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                println!("\nShutting down after the current cycle...");
                r.store(false, Ordering::SeqCst);
            })
            .map_err(|e| ForceError::Custom(format!("installing Ctrl-C handler: {e}")))?;

            loop {
                let report = pipeline.run_cycle(controller.as_deref(), now_secs()).await;
                print_run(&report);

                let Some(secs) = interval else {
                    break;
                };
                let mut waited = 0;
                while waited < secs && running.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    waited += 1;
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(())
        }
        Commands::Ingest {
            file,
            controller,
            resource,
        } => {
            let source = SqliteMetadataSource::connect(&config).await?;
            let mirror = config.local_base_dir.clone();
            let pipeline =
                ForcePipeline::new(Arc::new(config), db, source, MirrorTransport::new(mirror));
            let summary = pipeline
                .ingest_file(&Scope::new(controller, resource), file, now_secs())
                .await?;
            print_run(&RunReport {
                summaries: vec![summary],
                failures: Vec::new(),
            });
            Ok(())
        }
        Commands::SyncScopes => {
            let source = SqliteMetadataSource::default();
            let mirror = config.local_base_dir.clone();
            let pipeline =
                ForcePipeline::new(Arc::new(config), db, source, MirrorTransport::new(mirror));
            let report = pipeline.sync_scopes().await?;
            for scope in report.removed_scopes.iter() {
                println!("removed scope      {scope}");
            }
            for controller in report.removed_controllers.iter() {
                println!("removed controller {controller}");
            }
            for (target, e) in report.failures.iter() {
                eprintln!("FAILED {target}: {e}");
            }
            Ok(())
        }
        Commands::Show {
            controller,
            resource,
            active,
            json,
        } => {
            let op = match resource {
                Some(resource) => Op::GetScope(Scope::new(controller, resource)),
                None => Op::GetController(controller),
            };
            if let OpResult::Records(mut records) = dispatch(&db, op).await? {
                records.retain(|r| r.force_active || !active);
                if json {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                    return Ok(());
                }
                for r in records.iter() {
                    println!(
                        "{:<12} {:<10} {:<8} {:<6} {:<14} {:<20} {:<7} {}",
                        r.scope.to_string(),
                        r.bit_number,
                        r.declared_type.as_str(),
                        if r.force_active { "ACTIVE" } else { "-" },
                        r.value.to_string(),
                        r.kks,
                        r.forced_at,
                        r.reason.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        Commands::History {
            controller,
            resource,
            bit,
        } => {
            let op = Op::GetHistory(Scope::new(controller, resource), bit);
            if let OpResult::History(entries) = dispatch(&db, op).await? {
                for e in entries.iter() {
                    println!(
                        "{:>10} -> {:<10} {:<12} {:<12} {}",
                        e.forced_at,
                        e.deforced_at
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "open".to_string()),
                        e.forced_by.as_deref().unwrap_or(""),
                        e.ticket_ref.as_deref().unwrap_or(""),
                        e.reason.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        Commands::Annotate {
            controller,
            resource,
            bit,
            reason,
            forced_by,
            ticket,
        } => {
            let annotation = Annotation {
                reason,
                forced_by,
                ticket_ref: ticket,
            };
            let op = Op::Annotate(Scope::new(controller, resource), bit, annotation);
            println!("{}", dispatch(&db, op).await?);
            Ok(())
        }
    }
}

fn print_run(report: &RunReport) {
    for s in report.summaries.iter() {
        println!(
            "{:<16} {:>5} bits  +{} forced  +{} reforced  -{} deforced  {} invalid{}",
            s.scope.to_string(),
            s.batch_size,
            s.forced,
            s.reforced,
            s.deforced,
            s.invalid,
            if s.failed_chunks > 0 {
                format!("  ({} lookup chunks failed)", s.failed_chunks)
            } else {
                String::new()
            }
        );
    }
    for (target, e) in report.failures.iter() {
        eprintln!("FAILED {target}: {e}");
    }
}
