use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::game_log::{BoxScore, GameLogRecord, format_date, parse_date};
use crate::provider::StatsProvider;
use crate::retry::RetryPolicy;
use crate::store::bool_to_i64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub run_id: i64,
    pub label: String,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub errors: Vec<String>,
}

impl IngestSummary {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub units_total: usize,
    pub units_succeeded: usize,
    pub batches: Vec<IngestSummary>,
    pub errors: Vec<String>,
}

impl FetchReport {
    pub fn records_changed(&self) -> usize {
        self.batches.iter().map(IngestSummary::changed).sum()
    }

    fn absorb(&mut self, unit: &str, outcome: Result<IngestSummary>) {
        self.units_total += 1;
        match outcome {
            Ok(summary) => {
                self.units_succeeded += 1;
                self.batches.push(summary);
            }
            Err(err) => {
                warn!(unit, error = %err, "skipping unit");
                self.errors.push(format!("{unit}: {err}"));
            }
        }
    }
}

/// Upserts by (player, game); repeated keys in a batch collapse to the last occurrence.
pub fn ingest(conn: &mut Connection, label: &str, records: Vec<GameLogRecord>) -> Result<IngestSummary> {
    let mut summary = IngestSummary {
        label: label.to_string(),
        fetched: records.len(),
        ..Default::default()
    };

    let mut batch: BTreeMap<(i64, String), GameLogRecord> = BTreeMap::new();
    for record in records {
        if let Err(reason) = record.validate() {
            summary.rejected += 1;
            summary.errors.push(reason);
            continue;
        }
        let key = (record.player_id, record.game_id.clone());
        if batch.insert(key, record).is_some() {
            summary.duplicates += 1;
        }
    }
    if summary.duplicates > 0 {
        warn!(label, duplicates = summary.duplicates, "duplicate keys in batch collapsed");
    }

    let started_at = Utc::now().to_rfc3339();
    let tx = conn.transaction().context("begin ingest transaction")?;
    tx.execute(
        "INSERT INTO ingest_runs(label, started_at, finished_at, fetched, inserted, updated, unchanged, rejected, duplicates, errors_json)
         VALUES (?1, ?2, NULL, ?3, 0, 0, 0, 0, 0, '[]')",
        params![label, started_at, summary.fetched as i64],
    )
    .context("insert ingest run")?;
    let run_id = tx.last_insert_rowid();
    summary.run_id = run_id;

    for record in batch.values() {
        let hash = record.content_hash();
        let existing = tx
            .query_row(
                "SELECT content_hash, team_abbrev, game_date FROM game_logs WHERE player_id = ?1 AND game_id = ?2",
                params![record.player_id, record.game_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("lookup existing game log")?;
        match existing {
            Some((prev, _, _)) if prev == hash => {
                summary.unchanged += 1;
                continue;
            }
            Some((_, prev_team, prev_date)) => {
                let dup = PipelineError::DuplicateKey {
                    player_id: record.player_id,
                    game_id: record.game_id.clone(),
                };
                debug!(label, "{dup}");
                // Features keyed off the old team/date must be recomputed too.
                tx.execute(
                    "INSERT INTO game_log_revisions(run_id, player_id, game_id, prev_team_abbrev, prev_game_date)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![run_id, record.player_id, record.game_id, prev_team, prev_date],
                )
                .context("record game log revision")?;
                summary.updated += 1;
            }
            None => summary.inserted += 1,
        }
        upsert_game_log(&tx, record, &hash, run_id)?;
    }

    let errors_json = serde_json::to_string(&summary.errors).unwrap_or_else(|_| "[]".to_string());
    tx.execute(
        "UPDATE ingest_runs
         SET finished_at = ?1, inserted = ?2, updated = ?3, unchanged = ?4, rejected = ?5, duplicates = ?6, errors_json = ?7
         WHERE run_id = ?8",
        params![
            Utc::now().to_rfc3339(),
            summary.inserted as i64,
            summary.updated as i64,
            summary.unchanged as i64,
            summary.rejected as i64,
            summary.duplicates as i64,
            errors_json,
            run_id
        ],
    )
    .context("update ingest run")?;
    tx.commit().context("commit ingest transaction")?;

    info!(
        label,
        fetched = summary.fetched,
        inserted = summary.inserted,
        updated = summary.updated,
        unchanged = summary.unchanged,
        rejected = summary.rejected,
        "ingest complete"
    );
    Ok(summary)
}

fn upsert_game_log(
    tx: &rusqlite::Transaction<'_>,
    r: &GameLogRecord,
    hash: &str,
    run_id: i64,
) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO game_logs (
            player_id, game_id, player_name, game_date, season,
            team_id, team_abbrev, opponent_abbrev, is_home, minutes,
            pts, reb, ast, stl, blk, tov,
            fgm, fga, fg3m, fg3a, ftm, fta, plus_minus,
            content_hash, ingest_run, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16,
            ?17, ?18, ?19, ?20, ?21, ?22, ?23,
            ?24, ?25, ?26
        )
        ON CONFLICT(player_id, game_id) DO UPDATE SET
            player_name = excluded.player_name,
            game_date = excluded.game_date,
            season = excluded.season,
            team_id = excluded.team_id,
            team_abbrev = excluded.team_abbrev,
            opponent_abbrev = excluded.opponent_abbrev,
            is_home = excluded.is_home,
            minutes = excluded.minutes,
            pts = excluded.pts,
            reb = excluded.reb,
            ast = excluded.ast,
            stl = excluded.stl,
            blk = excluded.blk,
            tov = excluded.tov,
            fgm = excluded.fgm,
            fga = excluded.fga,
            fg3m = excluded.fg3m,
            fg3a = excluded.fg3a,
            ftm = excluded.ftm,
            fta = excluded.fta,
            plus_minus = excluded.plus_minus,
            content_hash = excluded.content_hash,
            ingest_run = excluded.ingest_run,
            updated_at = excluded.updated_at
        "#,
        params![
            r.player_id,
            r.game_id,
            r.player_name,
            format_date(r.game_date),
            r.season,
            r.team_id,
            r.team_abbrev,
            r.opponent_abbrev,
            bool_to_i64(r.is_home),
            r.minutes,
            r.stats.pts,
            r.stats.reb,
            r.stats.ast,
            r.stats.stl,
            r.stats.blk,
            r.stats.tov,
            r.stats.fgm,
            r.stats.fga,
            r.stats.fg3m,
            r.stats.fg3a,
            r.stats.ftm,
            r.stats.fta,
            r.stats.plus_minus,
            hash,
            run_id,
            Utc::now().to_rfc3339(),
        ],
    )
    .context("upsert game log")?;
    Ok(())
}

pub fn backfill(
    conn: &mut Connection,
    provider: &dyn StatsProvider,
    retry: &RetryPolicy,
    seasons: &[String],
) -> FetchReport {
    let mut report = FetchReport::default();
    for season in seasons {
        let unit = format!("season {season}");
        let outcome = retry
            .run(&unit, || provider.fetch_season(season))
            .map_err(anyhow::Error::from)
            .and_then(|rows| ingest(conn, &unit, rows));
        report.absorb(&unit, outcome);
    }
    info!(
        seasons = report.units_total,
        succeeded = report.units_succeeded,
        changed = report.records_changed(),
        "backfill complete"
    );
    report
}

pub fn backfill_players(
    conn: &mut Connection,
    provider: &dyn StatsProvider,
    retry: &RetryPolicy,
    player_ids: &[i64],
    seasons: &[String],
) -> FetchReport {
    let mut report = FetchReport::default();
    for player_id in player_ids {
        for season in seasons {
            let unit = format!("player {player_id} season {season}");
            let outcome = retry
                .run(&unit, || provider.fetch_player_season(*player_id, season))
                .map_err(anyhow::Error::from)
                .and_then(|rows| ingest(conn, &unit, rows));
            report.absorb(&unit, outcome);
        }
    }
    info!(
        units = report.units_total,
        succeeded = report.units_succeeded,
        changed = report.records_changed(),
        "player backfill complete"
    );
    report
}

pub fn pull_day(
    conn: &mut Connection,
    provider: &dyn StatsProvider,
    retry: &RetryPolicy,
    date: NaiveDate,
) -> FetchReport {
    let mut report = FetchReport::default();
    let unit = format!("day {}", format_date(date));
    let outcome = retry
        .run(&unit, || provider.fetch_day(date))
        .map_err(anyhow::Error::from)
        .and_then(|rows| ingest(conn, &unit, rows));
    report.absorb(&unit, outcome);
    report
}

const GAME_LOG_COLUMNS: &str = "player_id, game_id, player_name, game_date, season, team_id, team_abbrev, opponent_abbrev, is_home, minutes, pts, reb, ast, stl, blk, tov, fgm, fga, fg3m, fg3a, ftm, fta, plus_minus";

fn decode_game_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameLogRecord> {
    let raw_date: String = row.get(3)?;
    let game_date = parse_date(&raw_date).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("bad game_date {raw_date:?}").into(),
        )
    })?;
    Ok(GameLogRecord {
        player_id: row.get(0)?,
        game_id: row.get(1)?,
        player_name: row.get(2)?,
        game_date,
        season: row.get(4)?,
        team_id: row.get(5)?,
        team_abbrev: row.get(6)?,
        opponent_abbrev: row.get(7)?,
        is_home: row.get::<_, i64>(8)? != 0,
        minutes: row.get(9)?,
        stats: BoxScore {
            pts: row.get(10)?,
            reb: row.get(11)?,
            ast: row.get(12)?,
            stl: row.get(13)?,
            blk: row.get(14)?,
            tov: row.get(15)?,
            fgm: row.get(16)?,
            fga: row.get(17)?,
            fg3m: row.get(18)?,
            fg3a: row.get(19)?,
            ftm: row.get(20)?,
            fta: row.get(21)?,
            plus_minus: row.get(22)?,
        },
    })
}

pub fn load_game_logs(conn: &Connection, up_to: Option<NaiveDate>) -> Result<Vec<GameLogRecord>> {
    let cutoff = up_to.map(format_date).unwrap_or_else(|| "9999-12-31".to_string());
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {GAME_LOG_COLUMNS} FROM game_logs WHERE game_date <= ?1 ORDER BY player_id ASC, game_date ASC, game_id ASC"
        ))
        .context("prepare load game logs")?;
    let rows = stmt
        .query_map(params![cutoff], decode_game_log)
        .context("query game logs")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode game log row")?);
    }
    Ok(out)
}

pub fn load_player_history(conn: &Connection, player_id: i64) -> Result<Vec<GameLogRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {GAME_LOG_COLUMNS} FROM game_logs WHERE player_id = ?1 ORDER BY game_date ASC, game_id ASC"
        ))
        .context("prepare load player history")?;
    let rows = stmt
        .query_map(params![player_id], decode_game_log)
        .context("query player history")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode game log row")?);
    }
    Ok(out)
}

pub fn max_ingest_run(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(ingest_run), 0) FROM game_logs", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("query max ingest run")
}

// Includes the team a corrected row was moved away from.
pub fn affected_players_since(conn: &Connection, watermark: i64) -> Result<BTreeSet<i64>> {
    let mut stmt = conn
        .prepare(
            r#"
            WITH touched(team_abbrev, game_id) AS (
                SELECT team_abbrev, game_id FROM game_logs WHERE ingest_run > ?1
                UNION
                SELECT prev_team_abbrev, game_id FROM game_log_revisions WHERE run_id > ?1
            )
            SELECT DISTINCT g.player_id
            FROM game_logs g
            JOIN touched t ON t.team_abbrev = g.team_abbrev AND t.game_id = g.game_id
            UNION
            SELECT player_id FROM game_log_revisions WHERE run_id > ?1
            "#,
        )
        .context("prepare affected players query")?;
    let rows = stmt
        .query_map(params![watermark], |row| row.get::<_, i64>(0))
        .context("query affected players")?;
    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row.context("decode affected player")?);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivePlayer {
    pub player_id: i64,
    pub player_name: String,
    pub team_abbrev: String,
    pub last_game_date: NaiveDate,
}

/// Players with a game in the latest season seen strictly before `as_of`.
pub fn active_players(conn: &Connection, as_of: NaiveDate) -> Result<Vec<ActivePlayer>> {
    let cutoff = format_date(as_of);
    let season = conn
        .query_row(
            "SELECT MAX(season) FROM game_logs WHERE game_date < ?1",
            params![cutoff],
            |row| row.get::<_, Option<String>>(0),
        )
        .context("query latest season")?;
    let Some(season) = season else {
        return Ok(Vec::new());
    };

    let mut stmt = conn
        .prepare(
            "SELECT player_id, player_name, team_abbrev, game_date, game_id FROM game_logs
             WHERE season = ?1 AND game_date < ?2
             ORDER BY player_id ASC, game_date ASC, game_id ASC",
        )
        .context("prepare active players query")?;
    let rows = stmt
        .query_map(params![season, cutoff], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .context("query active players")?;

    let mut latest: HashMap<i64, ActivePlayer> = HashMap::new();
    for row in rows {
        let (player_id, player_name, team_abbrev, raw_date) = row.context("decode active player")?;
        let Some(last_game_date) = parse_date(&raw_date) else {
            continue;
        };
        latest.insert(
            player_id,
            ActivePlayer {
                player_id,
                player_name,
                team_abbrev,
                last_game_date,
            },
        );
    }
    let mut out = latest.into_values().collect::<Vec<_>>();
    out.sort_by_key(|p| p.player_id);
    Ok(out)
}
