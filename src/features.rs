use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::game_log::{GameLogRecord, Stat, format_date, parse_date};
use crate::ledger::{active_players, affected_players_since, load_game_logs, max_ingest_run};
use crate::provider::ScheduledGame;

pub const SENTINEL: f64 = -1.0;
pub const UNKNOWN_VENUE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    windows: Vec<usize>,
    stats: Vec<Stat>,
    columns: Vec<String>,
}

impl FeatureSchema {
    pub fn new(windows: &[usize], stats: &[Stat]) -> Self {
        let mut columns = Vec::new();
        for w in windows {
            columns.push(format!("min_roll_{w}"));
            for stat in stats {
                columns.push(format!("{}_roll_{w}", stat.key()));
            }
        }
        for w in windows {
            for stat in stats {
                columns.push(format!("{}_per_min_{w}", stat.key()));
            }
        }
        for w in windows {
            columns.push(format!("fg_pct_{w}"));
            columns.push(format!("ft_pct_{w}"));
        }
        for tail in ["days_rest", "is_home", "season_game_index", "usage_proxy"] {
            columns.push(tail.to_string());
        }
        Self {
            windows: windows.to_vec(),
            stats: stats.to_vec(),
            columns,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(&cfg.windows, &cfg.tracked_stats)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn stats(&self) -> &[Stat] {
        &self.stats
    }

    pub fn largest_window(&self) -> usize {
        self.windows.iter().copied().max().unwrap_or(1)
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.columns.join("\n").as_bytes());
        format!("{digest:x}")
    }

    pub fn check(&self, model: &str, columns: &[String]) -> Result<(), PipelineError> {
        if columns == self.columns.as_slice() {
            return Ok(());
        }
        let missing = self
            .columns
            .iter()
            .filter(|c| !columns.contains(c))
            .cloned()
            .collect::<Vec<_>>();
        let extra = columns
            .iter()
            .filter(|c| !self.columns.contains(c))
            .cloned()
            .collect::<Vec<_>>();
        let reordered = missing.is_empty() && extra.is_empty();
        Err(PipelineError::SchemaMismatch {
            model: model.to_string(),
            missing,
            extra,
            reordered,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetContext {
    pub player_id: i64,
    pub date: NaiveDate,
    pub game_id: Option<String>,
    pub season: String,
    pub is_home: Option<bool>,
}

impl TargetContext {
    fn for_game(record: &GameLogRecord) -> Self {
        Self {
            player_id: record.player_id,
            date: record.game_date,
            game_id: Some(record.game_id.clone()),
            season: record.season.clone(),
            is_home: Some(record.is_home),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSnapshot {
    pub player_id: i64,
    pub as_of: NaiveDate,
    pub target_game_id: Option<String>,
    pub season: String,
    pub history_games: usize,
    pub last_game_date: NaiveDate,
    pub values: Vec<f64>,
}

impl FeatureSnapshot {
    pub fn value(&self, schema: &FeatureSchema, column: &str) -> Option<f64> {
        schema.index_of(column).and_then(|i| self.values.get(i).copied())
    }
}

// Team possessions used per (team, game).
#[derive(Debug, Clone, Default)]
pub struct UsageIndex {
    totals: HashMap<(String, String), f64>,
}

impl UsageIndex {
    pub fn from_records(records: &[GameLogRecord]) -> Self {
        let mut totals = HashMap::new();
        for r in records {
            *totals
                .entry((r.team_abbrev.clone(), r.game_id.clone()))
                .or_insert(0.0) += r.stats.possessions_used();
        }
        Self { totals }
    }

    pub fn team_total(&self, team_abbrev: &str, game_id: &str) -> f64 {
        self.totals
            .get(&(team_abbrev.to_string(), game_id.to_string()))
            .copied()
            .unwrap_or(0.0)
    }
}

/// `history` is one player's records in chronological order; only games before the target count.
pub fn compute_snapshot(
    schema: &FeatureSchema,
    history: &[GameLogRecord],
    usage: &UsageIndex,
    target: &TargetContext,
) -> Result<FeatureSnapshot, PipelineError> {
    let n = history.partition_point(|r| r.game_date < target.date);
    let prior = &history[..n];
    let Some(last) = prior.last() else {
        return Err(PipelineError::InsufficientHistory {
            player_id: target.player_id,
            as_of: target.date,
            prior_games: 0,
        });
    };

    let mut values = Vec::with_capacity(schema.columns.len());
    for &w in &schema.windows {
        let tail = &prior[n - w.min(n)..];
        let len = tail.len() as f64;
        values.push(tail.iter().map(|r| r.minutes).sum::<f64>() / len);
        for &stat in &schema.stats {
            values.push(tail.iter().map(|r| r.stats.get(stat)).sum::<f64>() / len);
        }
    }
    for &w in &schema.windows {
        let tail = &prior[n - w.min(n)..];
        let minutes = tail.iter().map(|r| r.minutes).sum::<f64>();
        for &stat in &schema.stats {
            if minutes > 0.0 {
                values.push(tail.iter().map(|r| r.stats.get(stat)).sum::<f64>() / minutes);
            } else {
                values.push(SENTINEL);
            }
        }
    }
    for &w in &schema.windows {
        let tail = &prior[n - w.min(n)..];
        let (fgm, fga, ftm, fta) = tail.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, r| {
            (acc.0 + r.stats.fgm, acc.1 + r.stats.fga, acc.2 + r.stats.ftm, acc.3 + r.stats.fta)
        });
        values.push(if fga > 0.0 { fgm / fga } else { SENTINEL });
        values.push(if fta > 0.0 { ftm / fta } else { SENTINEL });
    }

    values.push(target.date.signed_duration_since(last.game_date).num_days() as f64);
    values.push(match target.is_home {
        Some(true) => 1.0,
        Some(false) => 0.0,
        None => UNKNOWN_VENUE,
    });
    let in_season = prior.iter().filter(|r| r.season == target.season).count();
    values.push((in_season + 1) as f64);

    let tail = &prior[n - schema.largest_window().min(n)..];
    let own = tail.iter().map(|r| r.stats.possessions_used()).sum::<f64>();
    let team = tail
        .iter()
        .map(|r| usage.team_total(&r.team_abbrev, &r.game_id))
        .sum::<f64>();
    values.push(if team > 0.0 { own / team } else { SENTINEL });

    Ok(FeatureSnapshot {
        player_id: target.player_id,
        as_of: target.date,
        target_game_id: target.game_id.clone(),
        season: target.season.clone(),
        history_games: n,
        last_game_date: last.game_date,
        values,
    })
}

pub fn training_snapshots(
    schema: &FeatureSchema,
    history: &[GameLogRecord],
    usage: &UsageIndex,
) -> (Vec<FeatureSnapshot>, usize) {
    let mut by_date: BTreeMap<NaiveDate, FeatureSnapshot> = BTreeMap::new();
    let mut insufficient = 0usize;
    for record in history {
        match compute_snapshot(schema, history, usage, &TargetContext::for_game(record)) {
            Ok(snapshot) => {
                by_date.insert(snapshot.as_of, snapshot);
            }
            Err(err) => {
                debug!(player_id = record.player_id, game_id = %record.game_id, "{err}");
                insufficient += 1;
            }
        }
    }
    (by_date.into_values().collect(), insufficient)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotKind {
    Game,
    Projection,
}

impl SnapshotKind {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Game => "game",
            SnapshotKind::Projection => "projection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureUpdate {
    pub mode: UpdateMode,
    pub players: usize,
    pub snapshots: usize,
    pub insufficient: usize,
    pub watermark: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureState {
    pub watermark: i64,
    pub fingerprint: String,
}

pub fn feature_state(conn: &Connection) -> Result<Option<FeatureState>> {
    conn.query_row(
        "SELECT ingest_watermark, schema_fingerprint FROM feature_state WHERE id = 1",
        [],
        |row| {
            Ok(FeatureState {
                watermark: row.get(0)?,
                fingerprint: row.get(1)?,
            })
        },
    )
    .optional()
    .context("read feature state")
}

fn write_state(tx: &Transaction<'_>, watermark: i64, fingerprint: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO feature_state(id, ingest_watermark, schema_fingerprint, updated_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            ingest_watermark = excluded.ingest_watermark,
            schema_fingerprint = excluded.schema_fingerprint,
            updated_at = excluded.updated_at",
        params![watermark, fingerprint, Utc::now().to_rfc3339()],
    )
    .context("write feature state")?;
    Ok(())
}

fn save_snapshots(
    tx: &Transaction<'_>,
    fingerprint: &str,
    kind: SnapshotKind,
    snapshots: &[FeatureSnapshot],
) -> Result<()> {
    let computed_at = Utc::now().to_rfc3339();
    let mut stmt = tx
        .prepare(
            "INSERT INTO player_features(
                player_id, as_of_date, kind, target_game_id, season, history_games,
                last_game_date, features_json, schema_fingerprint, computed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(player_id, as_of_date, kind) DO UPDATE SET
                target_game_id = excluded.target_game_id,
                season = excluded.season,
                history_games = excluded.history_games,
                last_game_date = excluded.last_game_date,
                features_json = excluded.features_json,
                schema_fingerprint = excluded.schema_fingerprint,
                computed_at = excluded.computed_at",
        )
        .context("prepare snapshot upsert")?;
    for s in snapshots {
        let features_json = serde_json::to_string(&s.values).context("serialize features")?;
        stmt.execute(params![
            s.player_id,
            format_date(s.as_of),
            kind.as_str(),
            s.target_game_id,
            s.season,
            s.history_games as i64,
            format_date(s.last_game_date),
            features_json,
            fingerprint,
            computed_at,
        ])
        .context("upsert snapshot")?;
    }
    Ok(())
}

fn group_by_player(records: Vec<GameLogRecord>) -> BTreeMap<i64, Vec<GameLogRecord>> {
    let mut out: BTreeMap<i64, Vec<GameLogRecord>> = BTreeMap::new();
    for r in records {
        out.entry(r.player_id).or_default().push(r);
    }
    out
}

fn compute_players(
    schema: &FeatureSchema,
    groups: &BTreeMap<i64, Vec<GameLogRecord>>,
    players: &[i64],
    usage: &UsageIndex,
) -> (Vec<FeatureSnapshot>, usize) {
    let results = players
        .par_iter()
        .map(|pid| match groups.get(pid) {
            Some(history) => training_snapshots(schema, history, usage),
            None => (Vec::new(), 0),
        })
        .collect::<Vec<_>>();

    let mut snapshots = Vec::new();
    let mut insufficient = 0;
    for (mut rows, skipped) in results {
        snapshots.append(&mut rows);
        insufficient += skipped;
    }
    snapshots.sort_by(|a, b| a.player_id.cmp(&b.player_id).then(a.as_of.cmp(&b.as_of)));
    (snapshots, insufficient)
}

pub fn rebuild_all(conn: &mut Connection, schema: &FeatureSchema) -> Result<FeatureUpdate> {
    let watermark = max_ingest_run(conn)?;
    let records = load_game_logs(conn, None)?;
    let usage = UsageIndex::from_records(&records);
    let groups = group_by_player(records);
    let players = groups.keys().copied().collect::<Vec<_>>();
    let (snapshots, insufficient) = compute_players(schema, &groups, &players, &usage);

    let fingerprint = schema.fingerprint();
    let tx = conn.transaction().context("begin feature rebuild")?;
    tx.execute("DELETE FROM player_features", [])
        .context("clear player features")?;
    save_snapshots(&tx, &fingerprint, SnapshotKind::Game, &snapshots)?;
    write_state(&tx, watermark, &fingerprint)?;
    tx.commit().context("commit feature rebuild")?;

    let update = FeatureUpdate {
        mode: UpdateMode::Full,
        players: players.len(),
        snapshots: snapshots.len(),
        insufficient,
        watermark,
    };
    info!(
        players = update.players,
        snapshots = update.snapshots,
        insufficient = update.insufficient,
        watermark,
        "feature rebuild complete"
    );
    Ok(update)
}

pub fn update_incremental(conn: &mut Connection, schema: &FeatureSchema) -> Result<FeatureUpdate> {
    let fingerprint = schema.fingerprint();
    let state = match feature_state(conn)? {
        Some(state) if state.fingerprint == fingerprint => state,
        Some(_) => {
            warn!("feature schema changed, rebuilding all snapshots");
            return rebuild_all(conn, schema);
        }
        None => return rebuild_all(conn, schema),
    };

    let watermark = max_ingest_run(conn)?;
    let players = affected_players_since(conn, state.watermark)?
        .into_iter()
        .collect::<Vec<_>>();
    let mut update = FeatureUpdate {
        mode: UpdateMode::Incremental,
        players: players.len(),
        snapshots: 0,
        insufficient: 0,
        watermark,
    };
    if players.is_empty() {
        let tx = conn.transaction().context("begin feature update")?;
        write_state(&tx, watermark, &fingerprint)?;
        tx.commit().context("commit feature update")?;
        info!(watermark, "features already current");
        return Ok(update);
    }

    let records = load_game_logs(conn, None)?;
    let usage = UsageIndex::from_records(&records);
    let groups = group_by_player(records);
    let (snapshots, insufficient) = compute_players(schema, &groups, &players, &usage);

    let tx = conn.transaction().context("begin feature update")?;
    for pid in &players {
        tx.execute(
            "DELETE FROM player_features WHERE player_id = ?1 AND kind = ?2",
            params![pid, SnapshotKind::Game.as_str()],
        )
        .context("clear player snapshots")?;
    }
    save_snapshots(&tx, &fingerprint, SnapshotKind::Game, &snapshots)?;
    write_state(&tx, watermark, &fingerprint)?;
    tx.commit().context("commit feature update")?;

    update.snapshots = snapshots.len();
    update.insufficient = insufficient;
    info!(
        players = update.players,
        snapshots = update.snapshots,
        from_watermark = state.watermark,
        watermark,
        "incremental feature update complete"
    );
    Ok(update)
}

#[derive(Debug, Clone, Default)]
pub struct ProjectionSnapshots {
    pub snapshots: Vec<FeatureSnapshot>,
    pub excluded: Vec<i64>,
}

// Replaces the snapshots of `date` and prunes earlier dates that were already projected.
pub fn project_snapshots(
    conn: &mut Connection,
    schema: &FeatureSchema,
    date: NaiveDate,
    slate: &[ScheduledGame],
) -> Result<ProjectionSnapshots> {
    let players = active_players(conn, date)?;
    let records = load_game_logs(conn, Some(date))?;
    let usage = UsageIndex::from_records(&records);
    let groups = group_by_player(records);

    let mut out = ProjectionSnapshots::default();
    for player in &players {
        let game = slate
            .iter()
            .find(|g| g.home_abbrev == player.team_abbrev || g.away_abbrev == player.team_abbrev);
        let target = TargetContext {
            player_id: player.player_id,
            date,
            game_id: game.map(|g| g.game_id.clone()),
            season: crate::game_log::season_for_date(date),
            is_home: game.map(|g| g.home_abbrev == player.team_abbrev),
        };
        let history = groups.get(&player.player_id).map(Vec::as_slice).unwrap_or(&[]);
        match compute_snapshot(schema, history, &usage, &target) {
            Ok(snapshot) => out.snapshots.push(snapshot),
            Err(err) => {
                warn!(player_id = player.player_id, "excluded from projection: {err}");
                out.excluded.push(player.player_id);
            }
        }
    }

    let day = format_date(date);
    let kind = SnapshotKind::Projection.as_str();
    let tx = conn.transaction().context("begin projection snapshots")?;
    tx.execute(
        "DELETE FROM player_features WHERE kind = ?1 AND as_of_date = ?2",
        params![kind, day],
    )
    .context("clear projection snapshots for date")?;
    let pruned = tx
        .execute(
            "DELETE FROM player_features
             WHERE kind = ?1 AND as_of_date < ?2
               AND as_of_date IN (SELECT DISTINCT projection_date FROM projections)",
            params![kind, day],
        )
        .context("prune projected snapshots")?;
    save_snapshots(&tx, &schema.fingerprint(), SnapshotKind::Projection, &out.snapshots)?;
    tx.commit().context("commit projection snapshots")?;
    info!(
        date = %day,
        players = out.snapshots.len(),
        excluded = out.excluded.len(),
        pruned,
        "projection snapshots ready"
    );
    Ok(out)
}

const SNAPSHOT_COLUMNS: &str =
    "player_id, as_of_date, target_game_id, season, history_games, last_game_date, features_json";

fn decode_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeatureSnapshot> {
    let bad = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };
    let raw_as_of: String = row.get(1)?;
    let raw_last: String = row.get(5)?;
    let raw_values: String = row.get(6)?;
    Ok(FeatureSnapshot {
        player_id: row.get(0)?,
        as_of: parse_date(&raw_as_of).ok_or_else(|| bad(1, format!("bad as_of_date {raw_as_of:?}")))?,
        target_game_id: row.get(2)?,
        season: row.get(3)?,
        history_games: row.get::<_, i64>(4)?.max(0) as usize,
        last_game_date: parse_date(&raw_last)
            .ok_or_else(|| bad(5, format!("bad last_game_date {raw_last:?}")))?,
        values: serde_json::from_str(&raw_values).map_err(|e| bad(6, e.to_string()))?,
    })
}

fn query_snapshots(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<FeatureSnapshot>> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM player_features WHERE {filter} ORDER BY player_id ASC, as_of_date ASC"
    );
    let mut stmt = conn.prepare(&sql).context("prepare snapshot query")?;
    let rows = stmt.query_map(args, decode_snapshot).context("query snapshots")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode snapshot")?);
    }
    Ok(out)
}

pub fn load_training_snapshots(conn: &Connection, schema: &FeatureSchema) -> Result<Vec<FeatureSnapshot>> {
    let fingerprint = schema.fingerprint();
    query_snapshots(
        conn,
        "kind = ?1 AND schema_fingerprint = ?2",
        params![SnapshotKind::Game.as_str(), fingerprint],
    )
}

pub fn load_snapshots_for_date(
    conn: &Connection,
    schema: &FeatureSchema,
    date: NaiveDate,
) -> Result<Vec<FeatureSnapshot>> {
    let fingerprint = schema.fingerprint();
    let as_of = format_date(date);
    query_snapshots(
        conn,
        "kind = ?1 AND as_of_date = ?2 AND schema_fingerprint = ?3",
        params![SnapshotKind::Projection.as_str(), as_of, fingerprint],
    )
}
