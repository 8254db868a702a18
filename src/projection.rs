use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{DatasetRow, load_current_rows};
use crate::features::FeatureSchema;
use crate::game_log::{Stat, format_date, parse_date};
use crate::ledger::active_players;
use crate::model::MAX_MINUTES;
use crate::training::{ModelRegistry, ModelSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub player_id: i64,
    pub player_name: String,
    pub team_abbrev: String,
    pub projection_date: NaiveDate,
    pub minutes: f64,
    pub rates: BTreeMap<Stat, f64>,
    pub values: BTreeMap<Stat, f64>,
    pub model_versions: BTreeMap<String, String>,
}

impl ProjectionRecord {
    pub fn value(&self, stat: Stat) -> Option<f64> {
        self.values.get(&stat).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub player_name: String,
    pub team_abbrev: String,
}

/// A mismatched rate model only drops its statistic; the minutes model must match.
pub fn compose(
    schema: &FeatureSchema,
    models: &ModelSet,
    rows: &[DatasetRow],
    players: &HashMap<i64, PlayerInfo>,
) -> Result<Vec<ProjectionRecord>> {
    let minutes_model = models
        .minutes
        .as_ref()
        .ok_or_else(|| anyhow!("no minutes model available"))?;
    minutes_model.check_schema(schema)?;

    let mut rate_models = Vec::new();
    for (stat, model) in &models.rates {
        match model.check_schema(schema) {
            Ok(()) => rate_models.push((*stat, model)),
            Err(err) => warn!(stat = %stat, "skipping rate model: {err}"),
        }
    }

    let mut versions = BTreeMap::new();
    versions.insert(minutes_model.target.name(), minutes_model.model_version.clone());
    for (_, model) in &rate_models {
        versions.insert(model.target.name(), model.model_version.clone());
    }

    let mut out: BTreeMap<i64, ProjectionRecord> = BTreeMap::new();
    for row in rows {
        let Some(info) = players.get(&row.player_id) else {
            warn!(player_id = row.player_id, "excluded from projection: unknown player");
            continue;
        };
        let minutes = minutes_model.predict(&row.features).clamp(0.0, MAX_MINUTES);
        let mut rates = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (stat, model) in &rate_models {
            let rate = model.predict(&row.features).max(0.0);
            rates.insert(*stat, rate);
            values.insert(*stat, minutes * rate);
        }
        out.insert(
            row.player_id,
            ProjectionRecord {
                player_id: row.player_id,
                player_name: info.player_name.clone(),
                team_abbrev: info.team_abbrev.clone(),
                projection_date: row.target_date,
                minutes,
                rates,
                values,
                model_versions: versions.clone(),
            },
        );
    }
    Ok(out.into_values().collect())
}

pub fn save_projections(conn: &mut Connection, date: NaiveDate, records: &[ProjectionRecord]) -> Result<()> {
    let day = format_date(date);
    let created_at = Utc::now().to_rfc3339();
    let tx = conn.transaction().context("begin projection write")?;
    tx.execute("DELETE FROM projections WHERE projection_date = ?1", params![day])
        .context("clear projections for date")?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO projections(
                    player_id, projection_date, player_name, team_abbrev, minutes,
                    rates_json, values_json, model_versions_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .context("prepare projection insert")?;
        for r in records {
            stmt.execute(params![
                r.player_id,
                day,
                r.player_name,
                r.team_abbrev,
                r.minutes,
                serde_json::to_string(&r.rates).context("serialize rates")?,
                serde_json::to_string(&r.values).context("serialize values")?,
                serde_json::to_string(&r.model_versions).context("serialize model versions")?,
                created_at,
            ])
            .context("insert projection")?;
        }
    }
    tx.commit().context("commit projection write")?;
    Ok(())
}

pub fn load_projections(conn: &Connection, date: NaiveDate) -> Result<Vec<ProjectionRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT player_id, projection_date, player_name, team_abbrev, minutes,
                    rates_json, values_json, model_versions_json
             FROM projections WHERE projection_date = ?1 ORDER BY player_id ASC",
        )
        .context("prepare projections query")?;
    let rows = stmt
        .query_map(params![format_date(date)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })
        .context("query projections")?;

    let mut out = Vec::new();
    for row in rows {
        let (player_id, raw_date, player_name, team_abbrev, minutes, rates, values, versions) =
            row.context("decode projection row")?;
        out.push(ProjectionRecord {
            player_id,
            player_name,
            team_abbrev,
            projection_date: parse_date(&raw_date)
                .ok_or_else(|| anyhow!("bad projection_date {raw_date:?}"))?,
            minutes,
            rates: serde_json::from_str(&rates).context("parse rates")?,
            values: serde_json::from_str(&values).context("parse values")?,
            model_versions: serde_json::from_str(&versions).context("parse model versions")?,
        });
    }
    Ok(out)
}

pub fn project(
    conn: &mut Connection,
    schema: &FeatureSchema,
    registry: &ModelRegistry,
    date: NaiveDate,
) -> Result<Vec<ProjectionRecord>> {
    let rows = load_current_rows(conn, schema, date)?;
    let players = active_players(conn, date)?
        .into_iter()
        .map(|p| {
            (
                p.player_id,
                PlayerInfo {
                    player_name: p.player_name,
                    team_abbrev: p.team_abbrev,
                },
            )
        })
        .collect::<HashMap<_, _>>();
    let models = registry.load_set(schema.stats())?;
    let records = compose(schema, &models, &rows, &players)?;
    save_projections(conn, date, &records)?;
    info!(
        date = %format_date(date),
        players = records.len(),
        rows = rows.len(),
        rate_models = models.rates.len(),
        "projections stored"
    );
    Ok(records)
}
