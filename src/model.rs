use std::fmt;

use chrono::{NaiveDate, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{TrainingParams, ValidationSplit};
use crate::dataset::{DatasetRow, Label};
use crate::error::PipelineError;
use crate::features::FeatureSchema;
use crate::game_log::Stat;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const MAX_MINUTES: f64 = 48.0;

const IMPROVEMENT_EPS: f64 = 1e-6;
const CHECK_EVERY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "stat")]
pub enum ModelTarget {
    Minutes,
    Rate(Stat),
}

impl ModelTarget {
    pub fn name(self) -> String {
        match self {
            ModelTarget::Minutes => "minutes".to_string(),
            ModelTarget::Rate(stat) => format!("rate_{}", stat.key()),
        }
    }

    pub fn label_value(self, label: &Label) -> Option<f64> {
        match self {
            ModelTarget::Minutes => Some(label.minutes),
            ModelTarget::Rate(stat) => label.rates.get(&stat).copied(),
        }
    }

    fn bounds(self) -> (f64, Option<f64>) {
        match self {
            ModelTarget::Minutes => (0.0, Some(MAX_MINUTES)),
            ModelTarget::Rate(_) => (0.0, None),
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub trained_at: String,
    pub data_through: Option<NaiveDate>,
    pub train_samples: usize,
    pub val_samples: usize,
    pub train_mae: f64,
    pub val_mae: Option<f64>,
    pub baseline_val_mae: Option<f64>,
    pub l2: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub target: ModelTarget,
    pub model_version: String,
    pub feature_columns: Vec<String>,
    pub schema_fingerprint: String,
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    pub coeffs: Vec<f64>,
    pub intercept: f64,
    pub clip_min: f64,
    pub clip_max: Option<f64>,
    pub metadata: TrainingMetadata,
}

impl ModelArtifact {
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), PipelineError> {
        schema.check(&self.target.name(), &self.feature_columns)
    }

    pub fn predict_raw(&self, x: &[f64]) -> f64 {
        let mut out = self.intercept;
        for (i, v) in x.iter().enumerate().take(self.coeffs.len()) {
            out += self.coeffs[i] * standardized(*v, self.feature_means[i], self.feature_stds[i]);
        }
        out
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        let raw = self.predict_raw(x);
        let lo = raw.max(self.clip_min);
        match self.clip_max {
            Some(hi) => lo.min(hi),
            None => lo,
        }
    }
}

struct Sample {
    x: Vec<f64>,
    y: f64,
}

pub fn fit(
    target: ModelTarget,
    schema: &FeatureSchema,
    rows: &[DatasetRow],
    params: &TrainingParams,
) -> Result<ModelArtifact, PipelineError> {
    let name = target.name();
    let width = schema.columns().len();
    let mut samples = Vec::new();
    for row in rows {
        let Some(y) = row.label.as_ref().and_then(|l| target.label_value(l)) else {
            continue;
        };
        if row.features.len() != width {
            return Err(PipelineError::training(
                &name,
                format!("row {} has {} features, expected {width}", row.row_key, row.features.len()),
            ));
        }
        if !y.is_finite() || row.features.iter().any(|v| !v.is_finite()) {
            continue;
        }
        samples.push(Sample {
            x: row.features.clone(),
            y,
        });
    }

    let needed = params.min_train_rows.max(2);
    if samples.len() < needed {
        return Err(PipelineError::training(
            &name,
            format!("{} usable rows, need at least {needed}", samples.len()),
        ));
    }
    let first = samples[0].y;
    if samples.iter().all(|s| s.y == first) {
        return Err(PipelineError::training(&name, "label has no variance"));
    }

    let (train_idx, val_idx) = split_indices(samples.len(), params);
    let train_raw = train_idx.iter().map(|&i| &samples[i]).collect::<Vec<_>>();
    let (feature_means, feature_stds) = feature_norm_stats(&train_raw, width);

    let prepare = |idx: &[usize]| {
        idx.iter()
            .map(|&i| Sample {
                x: samples[i]
                    .x
                    .iter()
                    .enumerate()
                    .map(|(j, v)| standardized(*v, feature_means[j], feature_stds[j]))
                    .collect(),
                y: samples[i].y,
            })
            .collect::<Vec<_>>()
    };
    let train = prepare(&train_idx);
    let val = prepare(&val_idx);

    let label_mean = train.iter().map(|s| s.y).sum::<f64>() / train.len() as f64;
    let baseline_val_mae = (!val.is_empty())
        .then(|| val.iter().map(|s| (s.y - label_mean).abs()).sum::<f64>() / val.len() as f64);

    let (coeffs, intercept, iterations) = fit_coeffs(&train, &val, label_mean, params);
    let (clip_min, clip_max) = target.bounds();
    let train_mae = mae(&coeffs, intercept, &train, clip_min, clip_max);
    let val_mae = (!val.is_empty()).then(|| mae(&coeffs, intercept, &val, clip_min, clip_max));
    debug!(
        model = %name,
        train = train.len(),
        val = val.len(),
        train_mae,
        val_mae = ?val_mae,
        baseline_val_mae = ?baseline_val_mae,
        iterations,
        "model fitted"
    );

    let now = Utc::now();
    Ok(ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        target,
        model_version: now.format("%Y%m%dT%H%M%S%6f").to_string(),
        feature_columns: schema.columns().to_vec(),
        schema_fingerprint: schema.fingerprint(),
        feature_means,
        feature_stds,
        coeffs,
        intercept,
        clip_min,
        clip_max,
        metadata: TrainingMetadata {
            trained_at: now.to_rfc3339(),
            data_through: rows.iter().map(|r| r.target_date).max(),
            train_samples: train.len(),
            val_samples: val.len(),
            train_mae,
            val_mae,
            baseline_val_mae,
            l2: params.l2,
            iterations,
        },
    })
}

fn split_indices(n: usize, params: &TrainingParams) -> (Vec<usize>, Vec<usize>) {
    let n_val = ((n as f64) * params.validation_fraction).round() as usize;
    let n_val = n_val.min(n.saturating_sub(1));
    let mut idx = (0..n).collect::<Vec<_>>();
    if let ValidationSplit::Shuffled { seed } = params.split {
        let mut rng = StdRng::seed_from_u64(seed);
        idx.shuffle(&mut rng);
    }
    let val = idx.split_off(n - n_val);
    (idx, val)
}

fn feature_norm_stats(samples: &[&Sample], width: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mean = vec![0.0; width];
    let mut var = vec![0.0; width];
    let n = samples.len().max(1) as f64;

    for sample in samples {
        for i in 0..width {
            mean[i] += sample.x[i];
        }
    }
    for v in &mut mean {
        *v /= n;
    }
    for sample in samples {
        for i in 0..width {
            let d = sample.x[i] - mean[i];
            var[i] += d * d;
        }
    }
    // Constant columns keep a unit scale so they contribute nothing.
    let stds = var
        .into_iter()
        .map(|v| {
            let s = (v / n).sqrt();
            if s > 1e-9 { s } else { 1.0 }
        })
        .collect();
    (mean, stds)
}

fn standardized(x: f64, mean: f64, std: f64) -> f64 {
    (x - mean) / std.max(1e-9)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn clip(v: f64, lo: f64, hi: Option<f64>) -> f64 {
    let v = v.max(lo);
    hi.map_or(v, |h| v.min(h))
}

fn mae(coeffs: &[f64], intercept: f64, samples: &[Sample], lo: f64, hi: Option<f64>) -> f64 {
    if samples.is_empty() {
        return f64::INFINITY;
    }
    samples
        .iter()
        .map(|s| (clip(intercept + dot(coeffs, &s.x), lo, hi) - s.y).abs())
        .sum::<f64>()
        / samples.len() as f64
}

// Keeps the coefficients with the best held-out MAE, or training MAE without a held-out set.
fn fit_coeffs(
    train: &[Sample],
    val: &[Sample],
    label_mean: f64,
    params: &TrainingParams,
) -> (Vec<f64>, f64, usize) {
    let width = train.first().map(|s| s.x.len()).unwrap_or(0);
    let monitor = if val.is_empty() { train } else { val };
    let mut coeffs = vec![0.0; width];
    let mut intercept = label_mean;
    let mut best = (coeffs.clone(), intercept);
    let mut best_mae = mae(&coeffs, intercept, monitor, f64::NEG_INFINITY, None);
    let mut no_improve = 0usize;
    let mut iterations = 0usize;
    let n = train.len().max(1) as f64;
    // Step scaled by width: collinear rolling windows would otherwise diverge.
    let lr_scale = 1.0 / (width.max(1) as f64);

    for iter in 0..params.max_iters {
        iterations = iter + 1;
        let mut grad = vec![0.0; width];
        let mut grad_b = 0.0;
        for sample in train {
            let err = intercept + dot(&coeffs, &sample.x) - sample.y;
            grad_b += err;
            for j in 0..width {
                grad[j] += err * sample.x[j];
            }
        }

        let lr = params.learning_rate / (1.0 + (iter as f64 * 0.003));
        for j in 0..width {
            let g = grad[j] / n + params.l2 * coeffs[j];
            coeffs[j] -= lr * lr_scale * g;
        }
        intercept -= lr * grad_b / n;

        if iter % CHECK_EVERY == 0 || iter + 1 == params.max_iters {
            let current = mae(&coeffs, intercept, monitor, f64::NEG_INFINITY, None);
            if current + IMPROVEMENT_EPS < best_mae {
                best_mae = current;
                best = (coeffs.clone(), intercept);
                no_improve = 0;
            } else {
                no_improve = no_improve.saturating_add(1);
                if no_improve >= params.patience.max(1) {
                    break;
                }
            }
        }
    }

    (best.0, best.1, iterations)
}
