use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli::report;
use enricher_core::config::{self, AppConfig};
use enricher_core::pipeline::{self, CancelFlag, RunMode};
use enricher_core::query::QueryService;
use enricher_core::registry::Registry;
use storage::{changes, pending, runs};

#[derive(Parser)]
#[command(name = "source-enricher")]
#[command(about = "Classifies and enriches a registry of information sources", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    /// Registry CSV, overriding registry.path from the config
    #[arg(long, global = true)]
    registry: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize, embed, cluster, classify and reconcile the registry
    Run {
        /// Keep the persisted cluster model and only place new sources
        #[arg(long)]
        warm: bool,
        /// Override reduction.seed
        #[arg(long)]
        seed: Option<u64>,
        /// Output JSON report
        #[arg(long)]
        json: bool,
    },
    /// Semantic search over source corpora
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        topk: usize,
        /// Only sources carrying one of these topical tags (comma-separated)
        #[arg(long, value_delimiter = ',', num_args = 1.., default_values_t = Vec::<String>::new())]
        tags: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Sources most similar to a given source
    Similar {
        source_id: String,
        #[arg(long, default_value_t = 10)]
        topk: usize,
        #[arg(long)]
        json: bool,
    },
    /// Members and signature terms of a cluster (-1 lists outliers)
    Cluster {
        #[arg(allow_hyphen_values = true)]
        id: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Show the change log, newest first
    Changes {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// Sources left unprocessed by earlier runs
    Pending {
        #[arg(long)]
        json: bool,
    },
    /// Classification breakdown of the registry
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(path) = cli.registry {
        cfg.registry.path = path;
    }

    match cli.command {
        Commands::Run { warm, seed, json } => {
            if seed.is_some() {
                cfg.reduction.seed = seed;
            }
            let mode = if warm { RunMode::Warm } else { RunMode::Cold };
            run_pipeline(cfg, mode, json).await
        }
        Commands::Search {
            query,
            topk,
            tags,
            json,
        } => run_search(cfg, query, topk, tags, json).await,
        Commands::Similar {
            source_id,
            topk,
            json,
        } => run_similar(cfg, source_id, topk, json).await,
        Commands::Cluster { id, json } => run_cluster(cfg, id, json).await,
        Commands::Changes {
            source,
            limit,
            json,
        } => run_changes(cfg, source, limit, json).await,
        Commands::Pending { json } => run_pending(cfg, json).await,
        Commands::Stats { json } => run_stats(cfg, json).await,
    }
}

async fn run_pipeline(cfg: AppConfig, mode: RunMode, json: bool) -> Result<()> {
    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current batch");
            on_signal.cancel();
        }
    });

    let summary = pipeline::run(&cfg, mode, &cancel).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", report::run_summary(&summary));
    }
    Ok(())
}

async fn run_search(cfg: AppConfig, query: String, topk: usize, tags: Vec<String>, json: bool) -> Result<()> {
    let service = QueryService::open(&cfg).await?;
    let hits = service.search(&query, topk, &tags).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("no matches");
    } else {
        for (i, hit) in hits.iter().enumerate() {
            println!("{}", report::hit_line(i + 1, hit));
        }
    }
    Ok(())
}

async fn run_similar(cfg: AppConfig, source_id: String, topk: usize, json: bool) -> Result<()> {
    let service = QueryService::open(&cfg).await?;
    let hits = service.similar_to(&source_id, topk)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        for (i, hit) in hits.iter().enumerate() {
            println!("{}", report::hit_line(i + 1, hit));
        }
    }
    Ok(())
}

async fn run_cluster(cfg: AppConfig, id: Option<i64>, json: bool) -> Result<()> {
    let service = QueryService::open(&cfg).await?;
    let ids = match id {
        Some(id) => vec![id],
        None => service.cluster_ids(),
    };
    let views = ids
        .into_iter()
        .map(|id| service.cluster_view(id))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else if views.is_empty() {
        println!("no cluster model; run the pipeline first");
    } else {
        for view in &views {
            for line in report::cluster_lines(view) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

async fn run_changes(cfg: AppConfig, source: Option<String>, limit: i64, json: bool) -> Result<()> {
    let pool = storage::connect(&cfg.database.path).await?;
    storage::migrate(&pool).await?;
    let entries = changes::list_changes(&pool, source.as_deref(), limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        let total = changes::count_changes(&pool).await?;
        println!("showing {} of {} change-log entries", entries.len(), total);
        for e in &entries {
            println!("{}", report::change_line(e));
        }
    }
    Ok(())
}

async fn run_pending(cfg: AppConfig, json: bool) -> Result<()> {
    let pool = storage::connect(&cfg.database.path).await?;
    storage::migrate(&pool).await?;
    let rows = pending::list_pending(&pool).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no pending sources");
    } else {
        for r in &rows {
            println!("{}", report::pending_line(r));
        }
    }
    Ok(())
}

async fn run_stats(cfg: AppConfig, json: bool) -> Result<()> {
    let registry = Registry::load(&cfg.registry.path).context("load registry")?;
    let breakdown = registry.breakdown();
    let pool = storage::connect(&cfg.database.path).await?;
    storage::migrate(&pool).await?;
    let recent = runs::last_runs(&pool, 5).await?;
    if json {
        let out = serde_json::json!({
            "sources": registry.len(),
            "rejected_rows": registry.rejected_rows(),
            "breakdown": breakdown,
            "recent_runs": recent,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "{} sources ({} rejected rows)",
            registry.len(),
            registry.rejected_rows().len()
        );
        for line in report::breakdown_lines(&breakdown) {
            println!("{}", line);
        }
        if !recent.is_empty() {
            println!("recent runs:");
            for r in &recent {
                println!("  {}", report::run_line(r));
            }
        }
    }
    Ok(())
}
