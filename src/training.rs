use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{Days, NaiveDate};
use rayon::prelude::*;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TrainingParams;
use crate::dataset::load_labeled_rows;
use crate::features::FeatureSchema;
use crate::game_log::Stat;
use crate::model::{ModelArtifact, ModelTarget, fit};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub target: ModelTarget,
    pub model_version: String,
    pub file: String,
    pub trained_at: String,
    pub val_mae: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub models: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn publish(&self, artifact: &ModelArtifact) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create model dir {}", self.dir.display()))?;

        let name = artifact.target.name();
        let mut file = format!("{name}-{}.json", artifact.model_version);
        let mut suffix = 1;
        while self.dir.join(&file).exists() {
            file = format!("{name}-{}-{suffix}.json", artifact.model_version);
            suffix += 1;
        }
        let path = self.dir.join(&file);
        let raw = serde_json::to_string_pretty(artifact).context("serialize model artifact")?;
        write_atomic(&path, raw.as_bytes())?;

        let mut manifest = self.manifest()?;
        manifest.models.insert(
            name,
            ManifestEntry {
                target: artifact.target,
                model_version: artifact.model_version.clone(),
                file,
                trained_at: artifact.metadata.trained_at.clone(),
                val_mae: artifact.metadata.val_mae,
            },
        );
        let raw = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        write_atomic(&self.dir.join(MANIFEST_FILE), raw.as_bytes())?;
        Ok(path)
    }

    pub fn load(&self, target: ModelTarget) -> Result<Option<ModelArtifact>> {
        let manifest = self.manifest()?;
        let Some(entry) = manifest.models.get(&target.name()) else {
            return Ok(None);
        };
        let path = self.dir.join(&entry.file);
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let artifact = serde_json::from_str::<ModelArtifact>(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        if artifact.target != target {
            return Err(anyhow!(
                "{} holds a {} model, expected {}",
                path.display(),
                artifact.target,
                target
            ));
        }
        Ok(Some(artifact))
    }

    pub fn load_set(&self, stats: &[Stat]) -> Result<ModelSet> {
        let minutes = self.load(ModelTarget::Minutes)?;
        let mut rates = BTreeMap::new();
        for &stat in stats {
            if let Some(model) = self.load(ModelTarget::Rate(stat))? {
                rates.insert(stat, model);
            }
        }
        Ok(ModelSet { minutes, rates })
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    pub minutes: Option<ModelArtifact>,
    pub rates: BTreeMap<Stat, ModelArtifact>,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub target: ModelTarget,
    pub result: Result<ManifestEntry, String>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub rows: usize,
    pub outcomes: Vec<TrainOutcome>,
}

impl TrainingReport {
    pub fn trained(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> Vec<ModelTarget> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.target)
            .collect()
    }
}

// A failed model keeps its previous artifact.
pub fn train_all(
    conn: &Connection,
    schema: &FeatureSchema,
    registry: &ModelRegistry,
    params: &TrainingParams,
    as_of: Option<NaiveDate>,
) -> Result<TrainingReport> {
    let since = match (params.max_training_age_days, as_of) {
        (Some(days), Some(date)) => date.checked_sub_days(Days::new(days.max(0) as u64)),
        _ => None,
    };
    let rows = load_labeled_rows(conn, schema, since)?;

    let mut targets = vec![ModelTarget::Minutes];
    targets.extend(schema.stats().iter().map(|&s| ModelTarget::Rate(s)));
    let fitted = targets
        .par_iter()
        .map(|&target| (target, fit(target, schema, &rows, params)))
        .collect::<Vec<_>>();

    let mut report = TrainingReport {
        rows: rows.len(),
        outcomes: Vec::new(),
    };
    for (target, result) in fitted {
        let result = match result {
            Ok(artifact) => match registry.publish(&artifact) {
                Ok(_) => {
                    info!(
                        model = %target,
                        version = %artifact.model_version,
                        train = artifact.metadata.train_samples,
                        val = artifact.metadata.val_samples,
                        val_mae = ?artifact.metadata.val_mae,
                        baseline_val_mae = ?artifact.metadata.baseline_val_mae,
                        "model published"
                    );
                    registry
                        .manifest()
                        .ok()
                        .and_then(|m| m.models.get(&target.name()).cloned())
                        .ok_or_else(|| format!("{target} missing from manifest after publish"))
                }
                Err(err) => Err(format!("{err:#}")),
            },
            Err(err) => Err(err.to_string()),
        };
        if let Err(reason) = &result {
            warn!(model = %target, "keeping previous artifact: {reason}");
        }
        report.outcomes.push(TrainOutcome { target, result });
    }

    info!(
        rows = report.rows,
        trained = report.trained(),
        failed = report.failed().len(),
        "training complete"
    );
    Ok(report)
}
