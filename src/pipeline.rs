use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::dataset::build_dataset;
use crate::export::{ExportReport, export};
use crate::features::{FeatureSchema, project_snapshots, update_incremental};
use crate::game_log::format_date;
use crate::ledger::pull_day;
use crate::model::ModelTarget;
use crate::provider::{ScheduledGame, StatsProvider};
use crate::projection::project;
use crate::retry::RetryPolicy;
use crate::training::{ModelRegistry, train_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Idle,
    Ingested,
    FeaturesUpdated,
    DatasetReady,
    ModelsReady,
    Projected,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::Idle,
        Stage::Ingested,
        Stage::FeaturesUpdated,
        Stage::DatasetReady,
        Stage::ModelsReady,
        Stage::Projected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Ingested => "ingested",
            Stage::FeaturesUpdated => "features_updated",
            Stage::DatasetReady => "dataset_ready",
            Stage::ModelsReady => "models_ready",
            Stage::Projected => "projected",
        }
    }

    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ORDER.iter().position(|s| *s == self)?;
        Stage::ORDER.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Stage::ORDER
            .iter()
            .copied()
            .find(|s| s.as_str() == raw.trim())
            .ok_or_else(|| format!("unknown stage {raw:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub date: NaiveDate,
    pub stage: Stage,
    pub updated_at: String,
    pub last_error: Option<String>,
}

pub fn run_status(conn: &Connection, date: NaiveDate) -> Result<Option<RunStatus>> {
    let row = conn
        .query_row(
            "SELECT stage, updated_at, last_error FROM pipeline_runs WHERE run_date = ?1",
            params![format_date(date)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()
        .context("read pipeline run")?;
    let Some((stage, updated_at, last_error)) = row else {
        return Ok(None);
    };
    let stage = stage.parse::<Stage>().map_err(|e| anyhow!(e))?;
    Ok(Some(RunStatus {
        date,
        stage,
        updated_at,
        last_error,
    }))
}

fn record_stage(conn: &Connection, date: NaiveDate, stage: Stage, last_error: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO pipeline_runs(run_date, stage, updated_at, last_error)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(run_date) DO UPDATE SET
            stage = excluded.stage,
            updated_at = excluded.updated_at,
            last_error = excluded.last_error",
        params![format_date(date), stage.as_str(), Utc::now().to_rfc3339(), last_error],
    )
    .context("write pipeline run")?;
    Ok(())
}

pub struct PipelineContext<'a> {
    pub config: &'a PipelineConfig,
    pub provider: &'a dyn StatsProvider,
    pub registry: ModelRegistry,
    pub schema: FeatureSchema,
}

impl<'a> PipelineContext<'a> {
    pub fn new(config: &'a PipelineConfig, provider: &'a dyn StatsProvider) -> Self {
        Self {
            config,
            provider,
            registry: ModelRegistry::new(config.model_dir.clone()),
            schema: FeatureSchema::from_config(config),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyReport {
    pub completed: Vec<Stage>,
    pub projections: usize,
    pub export: Option<ExportReport>,
}

/// Resumes after the last committed stage unless `restart` is set.
pub fn run_daily(
    conn: &mut Connection,
    ctx: &PipelineContext<'_>,
    date: NaiveDate,
    restart: bool,
) -> Result<DailyReport> {
    let mut stage = match run_status(conn, date)? {
        Some(status) if !restart => status.stage,
        _ => Stage::Idle,
    };
    if restart || stage == Stage::Idle {
        record_stage(conn, date, Stage::Idle, None)?;
    }
    if stage != Stage::Idle {
        info!(date = %format_date(date), stage = %stage, "resuming daily run");
    }

    let mut report = DailyReport::default();
    while let Some(next) = stage.next() {
        info!(date = %format_date(date), stage = %next, "stage starting");
        if let Err(err) = run_stage(conn, ctx, date, next, &mut report) {
            let message = format!("{next}: {err:#}");
            error!(date = %format_date(date), "{message}");
            record_stage(conn, date, stage, Some(&message))?;
            return Err(err.context(format!("daily run halted before {next}")));
        }
        record_stage(conn, date, next, None)?;
        report.completed.push(next);
        stage = next;
    }
    info!(
        date = %format_date(date),
        stages = report.completed.len(),
        projections = report.projections,
        "daily run complete"
    );
    Ok(report)
}

// A failed fetch leaves every venue unknown.
pub fn fetch_slate(provider: &dyn StatsProvider, retry: &RetryPolicy, date: NaiveDate) -> Vec<ScheduledGame> {
    match retry.run(&format!("scoreboard {}", format_date(date)), || {
        provider.fetch_scoreboard(date)
    }) {
        Ok(games) => games,
        Err(err) => {
            warn!("no slate for {}: {err}", format_date(date));
            Vec::new()
        }
    }
}

fn run_stage(
    conn: &mut Connection,
    ctx: &PipelineContext<'_>,
    date: NaiveDate,
    stage: Stage,
    report: &mut DailyReport,
) -> Result<()> {
    let cfg = ctx.config;
    match stage {
        Stage::Idle => Ok(()),
        Stage::Ingested => {
            let day = date
                .pred_opt()
                .ok_or_else(|| anyhow!("no day before {date}"))?;
            let fetched = pull_day(conn, ctx.provider, &cfg.retry, day);
            if !fetched.errors.is_empty() {
                warn!(errors = fetched.errors.len(), "continuing with the existing ledger");
            }
            Ok(())
        }
        Stage::FeaturesUpdated => {
            update_incremental(conn, &ctx.schema)?;
            let slate = fetch_slate(ctx.provider, &cfg.retry, date);
            project_snapshots(conn, &ctx.schema, date, &slate)?;
            Ok(())
        }
        Stage::DatasetReady => {
            build_dataset(conn, &ctx.schema, cfg.min_history_games, Some(date))?;
            Ok(())
        }
        Stage::ModelsReady => {
            let training = train_all(conn, &ctx.schema, &ctx.registry, &cfg.training, Some(date))?;
            let minutes = ctx
                .registry
                .load(ModelTarget::Minutes)?
                .ok_or_else(|| anyhow!("no minutes model after training {} rows", training.rows))?;
            minutes.check_schema(&ctx.schema)?;
            Ok(())
        }
        Stage::Projected => {
            let records = project(conn, &ctx.schema, &ctx.registry, date)?;
            let exported = export(
                &cfg.output_dir,
                &records,
                &cfg.tracked_stats,
                cfg.salience_stat,
                cfg.export_xlsx,
            )?;
            report.projections = records.len();
            report.export = Some(exported);
            Ok(())
        }
    }
}
