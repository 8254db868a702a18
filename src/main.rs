use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::info;

use nba_projections::config::PipelineConfig;
use nba_projections::dataset::build_dataset;
use nba_projections::export::export;
use nba_projections::features::{
    FeatureSchema, feature_state, project_snapshots, rebuild_all, update_incremental,
};
use nba_projections::game_log::{format_date, season_range};
use nba_projections::ledger::{backfill, backfill_players, pull_day};
use nba_projections::logging;
use nba_projections::pipeline::{PipelineContext, fetch_slate, run_daily, run_status};
use nba_projections::projection::project;
use nba_projections::provider::HttpStatsProvider;
use nba_projections::store::{open_db, table_count};
use nba_projections::training::{ModelRegistry, train_all};

/// Daily NBA player stat projections
#[derive(Parser)]
#[command(name = "nba_projections")]
#[command(about = "Ingest NBA game logs, train playing-time and rate models, project tomorrow's box scores")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file (defaults plus NBA_PROJ_* environment otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch whole seasons (or selected players) into the ledger
    Backfill {
        #[arg(long)]
        start_year: Option<i32>,

        #[arg(long)]
        end_year: Option<i32>,

        /// Comma-separated player ids; fetches per player instead of league-wide
        #[arg(long, value_delimiter = ',')]
        players: Vec<i64>,
    },

    /// Fetch the completed games of one day
    PullDay {
        #[arg(long)]
        date: NaiveDate,
    },

    /// Bring feature snapshots up to date
    RebuildFeatures {
        /// Recompute everything instead of only touched players
        #[arg(long)]
        full: bool,
    },

    /// Rebuild the model dataset, with current rows for a projection date
    BuildDataset {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Retrain the minutes and rate models
    Train {
        /// Reference date for the recency window
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Project a date with the current models and write the output files
    Project {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Run or resume the full daily pipeline
    RunDaily {
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Start again from the ingest stage
        #[arg(long)]
        restart: bool,
    },

    /// Show ledger, feature, model, and run state
    Status {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    if let Some(db) = &cli.db {
        cfg.db_path = db.clone();
    }
    Ok(cfg)
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "info" });

    let cfg = load_config(&cli)?;
    let mut conn = open_db(&cfg.db_path)?;
    let schema = FeatureSchema::from_config(&cfg);
    let registry = ModelRegistry::new(cfg.model_dir.clone());

    match cli.command {
        Commands::Backfill {
            start_year,
            end_year,
            players,
        } => {
            let provider = HttpStatsProvider::new(cfg.request_interval_ms)?;
            let seasons = season_range(
                start_year.unwrap_or(cfg.backfill_start_year),
                end_year.unwrap_or(cfg.backfill_end_year),
            );
            let report = if players.is_empty() {
                backfill(&mut conn, &provider, &cfg.retry, &seasons)
            } else {
                backfill_players(&mut conn, &provider, &cfg.retry, &players, &seasons)
            };
            println!(
                "backfill units={} ok={} changed={}",
                report.units_total,
                report.units_succeeded,
                report.records_changed()
            );
            for err in &report.errors {
                println!("  skipped {err}");
            }
        }
        Commands::PullDay { date } => {
            let provider = HttpStatsProvider::new(cfg.request_interval_ms)?;
            let report = pull_day(&mut conn, &provider, &cfg.retry, date);
            println!(
                "pull-day {} ok={} changed={}",
                format_date(date),
                report.units_succeeded,
                report.records_changed()
            );
        }
        Commands::RebuildFeatures { full } => {
            let update = if full {
                rebuild_all(&mut conn, &schema)?
            } else {
                update_incremental(&mut conn, &schema)?
            };
            println!(
                "features mode={:?} players={} snapshots={} watermark={}",
                update.mode, update.players, update.snapshots, update.watermark
            );
        }
        Commands::BuildDataset { date } => {
            if let Some(date) = date {
                project_snapshots(&mut conn, &schema, date, &[])?;
            }
            let summary = build_dataset(&mut conn, &schema, cfg.min_history_games, date)?;
            println!(
                "dataset labeled={} unlabeled={} excluded_history={} excluded_zero_minutes={}",
                summary.labeled,
                summary.unlabeled,
                summary.excluded_history,
                summary.excluded_zero_minutes
            );
        }
        Commands::Train { date } => {
            let report = train_all(&conn, &schema, &registry, &cfg.training, date)?;
            println!("trained {} of {} models on {} rows", report.trained(), report.outcomes.len(), report.rows);
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(entry) => println!("  {:10} v{} val_mae={:?}", outcome.target, entry.model_version, entry.val_mae),
                    Err(reason) => println!("  {:10} kept previous: {reason}", outcome.target),
                }
            }
        }
        Commands::Project { date } => {
            let date = date.unwrap_or_else(today);
            let provider = HttpStatsProvider::new(cfg.request_interval_ms)?;
            let slate = fetch_slate(&provider, &cfg.retry, date);
            project_snapshots(&mut conn, &schema, date, &slate)?;
            build_dataset(&mut conn, &schema, cfg.min_history_games, Some(date))?;
            let records = project(&mut conn, &schema, &registry, date)?;
            let report = export(
                &cfg.output_dir,
                &records,
                &cfg.tracked_stats,
                cfg.salience_stat,
                cfg.export_xlsx,
            )?;
            println!("projected {} players for {}", report.rows, format_date(date));
            if let Some(path) = &report.csv {
                println!("  {}", path.display());
            }
            if let Some(path) = &report.xlsx {
                println!("  {}", path.display());
            }
        }
        Commands::RunDaily { date, restart } => {
            let date = date.unwrap_or_else(today);
            let provider = HttpStatsProvider::new(cfg.request_interval_ms)?;
            let ctx = PipelineContext::new(&cfg, &provider);
            let report = run_daily(&mut conn, &ctx, date, restart)
                .with_context(|| format!("daily run {}", format_date(date)))?;
            info!(stages = report.completed.len(), projections = report.projections, "done");
        }
        Commands::Status { date } => {
            let date = date.unwrap_or_else(today);
            println!("db          {}", cfg.db_path.display());
            println!("game logs   {}", table_count(&conn, "game_logs")?);
            println!("snapshots   {}", table_count(&conn, "player_features")?);
            println!("dataset     {}", table_count(&conn, "model_dataset")?);
            match feature_state(&conn)? {
                Some(state) => println!(
                    "features    watermark={} current_schema={}",
                    state.watermark,
                    state.fingerprint == schema.fingerprint()
                ),
                None => println!("features    never built"),
            }
            for (name, entry) in registry.manifest()?.models {
                println!("model       {name} v{} val_mae={:?}", entry.model_version, entry.val_mae);
            }
            match run_status(&conn, date)? {
                Some(status) => {
                    println!("run {}  stage={}", format_date(date), status.stage);
                    if let Some(err) = status.last_error {
                        println!("  last error: {err}");
                    }
                }
                None => println!("run {}  not started", format_date(date)),
            }
        }
    }

    Ok(())
}
