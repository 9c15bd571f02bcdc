// mnemos: command-line front end for the memory engine.
//
// Every subcommand opens the vault, runs one engine operation and prints the
// result, either human-readable or as JSON with --json.

use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;

use mnemos_core::atoms::config::EngineConfig;
use mnemos_core::atoms::error::{EngineError, EngineResult};
use mnemos_core::atoms::types::{ContextBundle, ContextSource, LoadReport, MemoryId, MemoryRecord};
use mnemos_core::engine::config::load_config;
use mnemos_core::engine::consolidation::MaintenanceTask;
use mnemos_core::engine::context::MemoryContext;
use mnemos_core::engine::embedding::build_provider;
use mnemos_core::engine::encryption::MasterSecret;
use mnemos_core::engine::manager;
use mnemos_core::engine::profile::user_profile;
use mnemos_core::engine::retrieval::recall;
use mnemos_core::engine::snapshot::export_snapshot;

const DEFAULT_PASSPHRASE_ENV: &str = "MNEMOS_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(name = "mnemos", version, about = "Encrypted long-term memory for a conversational assistant")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true, env = "MNEMOS_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read the master passphrase from this environment variable
    #[arg(long, global = true, conflicts_with = "keyring")]
    passphrase_env: Option<String>,

    /// Use (or create) a random master secret in the OS keychain
    #[arg(long, global = true)]
    keyring: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a conversational turn
    Remember {
        text: String,
        /// Source turn id (random if omitted)
        #[arg(long)]
        turn: Option<String>,
        /// Store without an embedding if the provider is down
        #[arg(long)]
        allow_pending: bool,
    },
    /// Build a context bundle for a query
    Recall {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        max_hops: Option<usize>,
        /// Bundle size limit in characters
        #[arg(long)]
        budget: Option<usize>,
    },
    /// Adjust a memory's importance
    Reinforce {
        id: MemoryId,
        #[arg(allow_negative_numbers = true)]
        delta: f32,
    },
    /// Pin (or unpin) a memory so eviction skips it
    Pin {
        id: MemoryId,
        #[arg(long)]
        off: bool,
    },
    /// Run consolidation, decay and eviction now
    Maintain,
    /// Store statistics
    Stats,
    /// What the engine knows about the user
    Profile,
    /// Rebuild the vector index and graph from the blob store
    Rebuild {
        /// Only rebuild the knowledge graph
        #[arg(long)]
        graph_only: bool,
    },
    /// Embed memories stored while the provider was unavailable
    Reembed,
    /// Write a JSON snapshot of stats, profile, config and graph shape
    Export {
        /// Output file (defaults to snapshot-<timestamp>.json beside the database)
        path: Option<PathBuf>,
        /// Also write the decrypted memory text
        #[arg(long)]
        include_text: bool,
    },
}

#[derive(Serialize)]
struct RecordView {
    id: MemoryId,
    importance: f32,
    access_count: u32,
    pinned: bool,
}

impl From<MemoryRecord> for RecordView {
    fn from(r: MemoryRecord) -> Self {
        Self {
            id: r.id,
            importance: r.importance,
            access_count: r.access_count,
            pinned: r.pinned,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> EngineResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolve_secret(cli: &Cli) -> EngineResult<MasterSecret> {
    if let Some(var) = &cli.passphrase_env {
        return MasterSecret::from_env(var);
    }
    if cli.keyring || std::env::var_os(DEFAULT_PASSPHRASE_ENV).is_none() {
        return MasterSecret::from_keyring();
    }
    MasterSecret::from_env(DEFAULT_PASSPHRASE_ENV)
}

fn open_context(cli: &Cli) -> EngineResult<MemoryContext> {
    let mut config: EngineConfig = load_config(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    let secret = resolve_secret(cli)?;
    let embedder = build_provider(&config.embedding);
    MemoryContext::open(config, &secret, embedder)
}

fn print_bundle(bundle: &ContextBundle) {
    if bundle.degraded {
        println!("(degraded: keyword recall)");
    }
    for w in &bundle.warnings {
        println!("warning: {}", w);
    }
    for (rank, item) in bundle.items.iter().enumerate() {
        let origin = match &item.source {
            ContextSource::Memory { id, .. } => id.to_string(),
            ContextSource::Fact { hops, .. } => format!("fact, {} hop(s)", hops),
        };
        println!("{:>2}. [{:.3}] {}  ({})", rank + 1, item.score, item.content, origin);
    }
    println!(
        "{} of {} candidates, {} chars",
        bundle.items.len(),
        bundle.candidates,
        bundle.budget_used
    );
}

async fn run(cli: Cli) -> EngineResult<()> {
    let ctx = open_context(&cli)?;

    match &cli.command {
        Command::Remember {
            text,
            turn,
            allow_pending,
        } => {
            let turn = turn
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let id = match manager::remember(&ctx, text, turn.as_str()).await {
                Err(EngineError::EmbeddingUnavailable(reason)) if *allow_pending => {
                    info!("[mnemos:cli] Storing without embedding: {}", reason);
                    manager::remember_keyword_only(&ctx, text, turn.as_str())?
                }
                other => other?,
            };
            if cli.json {
                print_json(&serde_json::json!({ "id": id }))?;
            } else {
                println!("{}", id);
            }
        }
        Command::Recall {
            query,
            top_k,
            max_hops,
            budget,
        } => {
            let mut opts = ctx.config.recall_options();
            if let Some(k) = top_k {
                opts.top_k = *k;
            }
            if let Some(h) = max_hops {
                opts.max_hops = *h;
            }
            if let Some(b) = budget {
                opts.context_budget = *b;
            }
            let bundle = recall(&ctx, query, opts).await;
            if cli.json {
                print_json(&bundle)?;
            } else {
                print_bundle(&bundle);
            }
        }
        Command::Reinforce { id, delta } => {
            let view = RecordView::from(manager::reinforce(&ctx, *id, *delta)?);
            if cli.json {
                print_json(&view)?;
            } else {
                println!("{} importance {:.3}", view.id, view.importance);
            }
        }
        Command::Pin { id, off } => {
            let view = RecordView::from(manager::pin(&ctx, *id, !*off)?);
            if cli.json {
                print_json(&view)?;
            } else {
                println!("{} pinned: {}", view.id, view.pinned);
            }
        }
        Command::Maintain => {
            let report = MaintenanceTask::from_context(&ctx).run(&ctx);
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "merged {} clusters ({} retired, {} failed), decayed {}, evicted {}{}",
                    report.clusters_merged,
                    report.records_retired,
                    report.failed_clusters,
                    report.records_decayed,
                    report.records_evicted,
                    if report.aborted { " (budget exhausted)" } else { "" }
                );
            }
        }
        Command::Stats => {
            let stats = ctx.stats()?;
            if cli.json {
                print_json(&serde_json::json!({
                    "stats": stats,
                    "load": ctx.load_report,
                }))?;
            } else {
                println!("records:        {} ({} pending, {} pinned)", stats.records, stats.pending, stats.pinned);
                println!("facts:          {} active, {} inactive", stats.active_edges, stats.inactive_edges);
                println!("forwards:       {}", stats.forwards);
                println!("quarantined:    {}", stats.quarantined);
                println!("mean importance {:.3}", stats.mean_importance);
                println!("dimension:      {}", stats.dimension);
                for (table, rows) in ctx.artifact_rows()? {
                    println!("  {:<16} {} rows", table, rows);
                }
            }
        }
        Command::Profile => {
            let profile = user_profile(&ctx);
            if cli.json {
                print_json(&profile)?;
            } else {
                println!("Preferences:");
                for p in &profile.preferences {
                    println!("  {} {} ({:.2})", p.predicate.replace('_', " "), p.object, p.confidence);
                }
                println!("Highlights:");
                for h in &profile.highlights {
                    println!("  {} [{:.2}] {}", h.id, h.importance, h.text);
                }
            }
        }
        Command::Rebuild { graph_only } => {
            let mut report = LoadReport::default();
            if !*graph_only {
                report.merge(manager::rebuild_vector_index_from_blobs(&ctx).await?);
            }
            report.merge(manager::rebuild_graph_from_blobs(&ctx)?);
            if cli.json {
                print_json(&report)?;
            } else {
                println!("rebuilt: {} loaded, {} quarantined", report.loaded, report.quarantined);
                for w in &report.warnings {
                    println!("warning: {}", w);
                }
            }
        }
        Command::Reembed => {
            let report = manager::reembed_pending(&ctx).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "embedded {}, merged {}, still pending {}",
                    report.embedded, report.merged, report.remaining
                );
            }
        }
        Command::Export { path, include_text } => {
            let written = export_snapshot(&ctx, path.as_deref(), *include_text)?;
            if cli.json {
                print_json(&serde_json::json!({ "path": written }))?;
            } else {
                println!("{}", written.display());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("mnemos: {}", e);
        std::process::exit(1);
    }
}
