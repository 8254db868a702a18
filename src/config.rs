use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::game_log::Stat;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "NBA_PROJ_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationSplit {
    /// Hold out the most recent rows.
    Chronological,
    /// Hold out a seeded random sample.
    Shuffled { seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub l2: f64,
    pub learning_rate: f64,
    pub max_iters: usize,
    pub patience: usize,
    pub validation_fraction: f64,
    pub split: ValidationSplit,
    pub min_train_rows: usize,
    pub max_training_age_days: Option<i64>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            l2: 0.01,
            learning_rate: 0.05,
            max_iters: 2000,
            patience: 20,
            validation_fraction: 0.2,
            split: ValidationSplit::Chronological,
            min_train_rows: 50,
            max_training_age_days: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    pub backfill_start_year: i32,
    pub backfill_end_year: i32,
    pub windows: Vec<usize>,
    pub tracked_stats: Vec<Stat>,
    pub min_history_games: usize,
    pub training: TrainingParams,
    pub retry: RetryPolicy,
    pub request_interval_ms: u64,
    pub salience_stat: Stat,
    pub export_xlsx: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let year = Local::now().date_naive().year();
        Self {
            db_path: PathBuf::from("data/nba_projections.sqlite"),
            model_dir: PathBuf::from("data/models"),
            output_dir: PathBuf::from("outputs/projections"),
            backfill_start_year: year - 2,
            backfill_end_year: year - 1,
            windows: vec![3, 5, 10, 20],
            tracked_stats: vec![
                Stat::Pts,
                Stat::Reb,
                Stat::Ast,
                Stat::Stl,
                Stat::Blk,
                Stat::Tov,
            ],
            min_history_games: 5,
            training: TrainingParams::default(),
            retry: RetryPolicy::default(),
            request_interval_ms: 600,
            salience_stat: Stat::Pts,
            export_xlsx: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = serde_json::from_str::<PipelineConfig>(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg.validated()?)
    }

    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let cfg = Self::from_lookup(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut cfg = Self::default();
        if let Some(v) = get("DB") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("MODEL_DIR") {
            cfg.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OUTPUT_DIR") {
            cfg.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("START_YEAR") {
            cfg.backfill_start_year = parse_num(&v, "START_YEAR")?;
        }
        if let Some(v) = get("END_YEAR") {
            cfg.backfill_end_year = parse_num(&v, "END_YEAR")?;
        }
        if let Some(v) = get("WINDOWS") {
            cfg.windows = parse_list(&v, "WINDOWS", |s| s.parse::<usize>().ok())?;
        }
        if let Some(v) = get("STATS") {
            cfg.tracked_stats = parse_list(&v, "STATS", |s| s.parse::<Stat>().ok())?;
        }
        if let Some(v) = get("MIN_HISTORY") {
            cfg.min_history_games = parse_num(&v, "MIN_HISTORY")?;
        }
        if let Some(v) = get("MIN_TRAIN_ROWS") {
            cfg.training.min_train_rows = parse_num(&v, "MIN_TRAIN_ROWS")?;
        }
        if let Some(v) = get("MAX_TRAINING_AGE_DAYS") {
            cfg.training.max_training_age_days = Some(parse_num(&v, "MAX_TRAINING_AGE_DAYS")?);
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            cfg.retry.max_attempts = parse_num(&v, "MAX_ATTEMPTS")?;
        }
        if let Some(v) = get("REQUEST_INTERVAL_MS") {
            cfg.request_interval_ms = parse_num(&v, "REQUEST_INTERVAL_MS")?;
        }
        if let Some(v) = get("SALIENCE_STAT") {
            cfg.salience_stat = v.parse::<Stat>().map_err(PipelineError::Config)?;
        }
        if let Some(v) = get("EXPORT_XLSX") {
            cfg.export_xlsx = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        cfg.validated()
    }

    pub fn validated(mut self) -> Result<Self, PipelineError> {
        self.windows.retain(|w| *w > 0);
        self.windows.sort_unstable();
        self.windows.dedup();
        if self.windows.is_empty() {
            return Err(PipelineError::config("at least one positive window size is required"));
        }

        let mut seen = Vec::new();
        self.tracked_stats.retain(|s| {
            if seen.contains(s) {
                false
            } else {
                seen.push(*s);
                true
            }
        });
        if self.tracked_stats.is_empty() {
            return Err(PipelineError::config("tracked_stats must not be empty"));
        }
        if self.backfill_end_year < self.backfill_start_year {
            return Err(PipelineError::config(format!(
                "backfill_end_year ({}) is before backfill_start_year ({})",
                self.backfill_end_year, self.backfill_start_year
            )));
        }
        if !(0.0..1.0).contains(&self.training.validation_fraction) {
            return Err(PipelineError::config("validation_fraction must be in [0, 1)"));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::config("retry.max_attempts must be at least 1"));
        }
        self.min_history_games = self.min_history_games.max(1);
        Ok(self)
    }

    pub fn largest_window(&self) -> usize {
        self.windows.last().copied().unwrap_or(1)
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, PipelineError> {
    raw.parse::<T>()
        .map_err(|_| PipelineError::config(format!("{ENV_PREFIX}{name}: cannot parse {raw:?}")))
}

fn parse_list<T>(
    raw: &str,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, PipelineError> {
    raw.split([',', ';', ' '])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            parse(part).ok_or_else(|| {
                PipelineError::config(format!("{ENV_PREFIX}{name}: invalid entry {part:?}"))
            })
        })
        .collect()
}
