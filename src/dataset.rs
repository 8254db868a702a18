use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::features::{FeatureSchema, FeatureSnapshot, load_snapshots_for_date, load_training_snapshots};
use crate::game_log::{GameLogRecord, Stat, format_date, parse_date};
use crate::ledger::load_game_logs;
use crate::store::bool_to_i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub minutes: f64,
    pub rates: BTreeMap<Stat, f64>,
}

impl Label {
    fn from_game(game: &GameLogRecord, stats: &[Stat]) -> Self {
        let rates = stats
            .iter()
            .map(|&s| (s, game.stats.get(s) / game.minutes))
            .collect();
        Self {
            minutes: game.minutes,
            rates,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub player_id: i64,
    pub row_key: String,
    pub target_date: NaiveDate,
    pub history_games: usize,
    pub features: Vec<f64>,
    pub label: Option<Label>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPurpose {
    Training,
    Inference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    InsufficientHistory,
    ZeroMinutes,
}

/// Shared by training and inference; training also needs `min_history` prior games.
pub fn eligibility(
    purpose: RowPurpose,
    history_games: usize,
    target_minutes: Option<f64>,
    min_history: usize,
) -> Result<(), Exclusion> {
    let needed = match purpose {
        RowPurpose::Training => min_history.max(1),
        RowPurpose::Inference => 1,
    };
    if history_games < needed {
        return Err(Exclusion::InsufficientHistory);
    }
    if purpose == RowPurpose::Training && target_minutes.is_none_or(|m| m <= 0.0) {
        return Err(Exclusion::ZeroMinutes);
    }
    Ok(())
}

pub fn upcoming_key(date: NaiveDate) -> String {
    format!("upcoming:{}", format_date(date))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetSummary {
    pub labeled: usize,
    pub unlabeled: usize,
    pub excluded_history: usize,
    pub excluded_zero_minutes: usize,
    pub missing_games: usize,
}

pub fn training_rows(
    snapshots: &[FeatureSnapshot],
    games: &HashMap<(i64, String), GameLogRecord>,
    stats: &[Stat],
    min_history: usize,
    summary: &mut DatasetSummary,
) -> Vec<DatasetRow> {
    let mut rows = Vec::new();
    for snap in snapshots {
        let Some(game_id) = snap.target_game_id.as_ref() else {
            continue;
        };
        let Some(game) = games.get(&(snap.player_id, game_id.clone())) else {
            summary.missing_games += 1;
            continue;
        };
        match eligibility(RowPurpose::Training, snap.history_games, Some(game.minutes), min_history) {
            Ok(()) => rows.push(DatasetRow {
                player_id: snap.player_id,
                row_key: game_id.clone(),
                target_date: snap.as_of,
                history_games: snap.history_games,
                features: snap.values.clone(),
                label: Some(Label::from_game(game, stats)),
            }),
            Err(Exclusion::InsufficientHistory) => summary.excluded_history += 1,
            Err(Exclusion::ZeroMinutes) => summary.excluded_zero_minutes += 1,
        }
    }
    rows
}

pub fn current_rows(snapshots: &[FeatureSnapshot], date: NaiveDate, summary: &mut DatasetSummary) -> Vec<DatasetRow> {
    let mut rows = Vec::new();
    for snap in snapshots.iter().filter(|s| s.as_of == date) {
        if eligibility(RowPurpose::Inference, snap.history_games, None, 0).is_err() {
            warn!(player_id = snap.player_id, "excluded from current rows: no prior games");
            summary.excluded_history += 1;
            continue;
        }
        rows.push(DatasetRow {
            player_id: snap.player_id,
            row_key: upcoming_key(date),
            target_date: date,
            history_games: snap.history_games,
            features: snap.values.clone(),
            label: None,
        });
    }
    rows
}

pub fn build_dataset(
    conn: &mut Connection,
    schema: &FeatureSchema,
    min_history: usize,
    projection_date: Option<NaiveDate>,
) -> Result<DatasetSummary> {
    let mut summary = DatasetSummary::default();
    let games = load_game_logs(conn, None)?
        .into_iter()
        .map(|g| ((g.player_id, g.game_id.clone()), g))
        .collect::<HashMap<_, _>>();
    let snapshots = load_training_snapshots(conn, schema)?;
    let mut rows = training_rows(&snapshots, &games, schema.stats(), min_history, &mut summary);
    summary.labeled = rows.len();

    if let Some(date) = projection_date {
        let current = load_snapshots_for_date(conn, schema, date)?;
        let mut upcoming = current_rows(&current, date, &mut summary);
        summary.unlabeled = upcoming.len();
        rows.append(&mut upcoming);
    }

    let fingerprint = schema.fingerprint();
    let tx = conn.transaction().context("begin dataset build")?;
    tx.execute("DELETE FROM model_dataset", [])
        .context("clear model dataset")?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO model_dataset(
                    player_id, row_key, target_date, labeled, history_games,
                    features_json, label_json, schema_fingerprint
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .context("prepare dataset insert")?;
        for row in &rows {
            let features_json = serde_json::to_string(&row.features).context("serialize features")?;
            let label_json = row
                .label
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("serialize label")?;
            stmt.execute(params![
                row.player_id,
                row.row_key,
                format_date(row.target_date),
                bool_to_i64(row.label.is_some()),
                row.history_games as i64,
                features_json,
                label_json,
                fingerprint,
            ])
            .context("insert dataset row")?;
        }
    }
    tx.commit().context("commit dataset build")?;

    info!(
        labeled = summary.labeled,
        unlabeled = summary.unlabeled,
        excluded_history = summary.excluded_history,
        excluded_zero_minutes = summary.excluded_zero_minutes,
        missing_games = summary.missing_games,
        "dataset built"
    );
    Ok(summary)
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatasetRow> {
    let bad = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };
    let raw_date: String = row.get(2)?;
    let raw_features: String = row.get(4)?;
    let raw_label: Option<String> = row.get(5)?;
    let label = match raw_label {
        Some(raw) => Some(serde_json::from_str::<Label>(&raw).map_err(|e| bad(5, e.to_string()))?),
        None => None,
    };
    Ok(DatasetRow {
        player_id: row.get(0)?,
        row_key: row.get(1)?,
        target_date: parse_date(&raw_date).ok_or_else(|| bad(2, format!("bad target_date {raw_date:?}")))?,
        history_games: row.get::<_, i64>(3)?.max(0) as usize,
        features: serde_json::from_str(&raw_features).map_err(|e| bad(4, e.to_string()))?,
        label,
    })
}

pub fn load_labeled_rows(
    conn: &Connection,
    schema: &FeatureSchema,
    since: Option<NaiveDate>,
) -> Result<Vec<DatasetRow>> {
    let floor = since.map(format_date).unwrap_or_default();
    let mut stmt = conn
        .prepare(
            "SELECT player_id, row_key, target_date, history_games, features_json, label_json
             FROM model_dataset
             WHERE labeled = 1 AND schema_fingerprint = ?1 AND target_date >= ?2
             ORDER BY target_date ASC, player_id ASC, row_key ASC",
        )
        .context("prepare labeled rows query")?;
    let rows = stmt
        .query_map(params![schema.fingerprint(), floor], decode_row)
        .context("query labeled rows")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode dataset row")?);
    }
    Ok(out)
}

pub fn load_current_rows(conn: &Connection, schema: &FeatureSchema, date: NaiveDate) -> Result<Vec<DatasetRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT player_id, row_key, target_date, history_games, features_json, label_json
             FROM model_dataset
             WHERE labeled = 0 AND schema_fingerprint = ?1 AND row_key = ?2
             ORDER BY player_id ASC",
        )
        .context("prepare current rows query")?;
    let rows = stmt
        .query_map(params![schema.fingerprint(), upcoming_key(date)], decode_row)
        .context("query current rows")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode dataset row")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_needs_history_and_minutes() {
        assert_eq!(eligibility(RowPurpose::Training, 5, Some(20.0), 5), Ok(()));
        assert_eq!(
            eligibility(RowPurpose::Training, 4, Some(20.0), 5),
            Err(Exclusion::InsufficientHistory)
        );
        assert_eq!(
            eligibility(RowPurpose::Training, 9, Some(0.0), 5),
            Err(Exclusion::ZeroMinutes)
        );
    }

    #[test]
    fn inference_keeps_short_histories() {
        assert_eq!(eligibility(RowPurpose::Inference, 1, None, 5), Ok(()));
        assert_eq!(
            eligibility(RowPurpose::Inference, 0, None, 5),
            Err(Exclusion::InsufficientHistory)
        );
    }

    #[test]
    fn upcoming_rows_use_date_key() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        assert_eq!(upcoming_key(date), "upcoming:2024-02-01");
    }
}
