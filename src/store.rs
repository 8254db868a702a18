use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")
        .context("enable wal")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS game_logs (
            player_id INTEGER NOT NULL,
            game_id TEXT NOT NULL,
            player_name TEXT NOT NULL,
            game_date TEXT NOT NULL,
            season TEXT NOT NULL,
            team_id INTEGER NOT NULL,
            team_abbrev TEXT NOT NULL,
            opponent_abbrev TEXT NOT NULL,
            is_home INTEGER NOT NULL,
            minutes REAL NOT NULL,
            pts REAL NOT NULL,
            reb REAL NOT NULL,
            ast REAL NOT NULL,
            stl REAL NOT NULL,
            blk REAL NOT NULL,
            tov REAL NOT NULL,
            fgm REAL NOT NULL,
            fga REAL NOT NULL,
            fg3m REAL NOT NULL,
            fg3a REAL NOT NULL,
            ftm REAL NOT NULL,
            fta REAL NOT NULL,
            plus_minus REAL NOT NULL,
            content_hash TEXT NOT NULL,
            ingest_run INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (player_id, game_id)
        );
        CREATE INDEX IF NOT EXISTS idx_game_logs_date ON game_logs(game_date);
        CREATE INDEX IF NOT EXISTS idx_game_logs_player_date ON game_logs(player_id, game_date);
        CREATE INDEX IF NOT EXISTS idx_game_logs_ingest_run ON game_logs(ingest_run);

        CREATE TABLE IF NOT EXISTS game_log_revisions (
            run_id INTEGER NOT NULL,
            player_id INTEGER NOT NULL,
            game_id TEXT NOT NULL,
            prev_team_abbrev TEXT NOT NULL,
            prev_game_date TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_game_log_revisions_run ON game_log_revisions(run_id);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            fetched INTEGER NOT NULL,
            inserted INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            unchanged INTEGER NOT NULL,
            rejected INTEGER NOT NULL,
            duplicates INTEGER NOT NULL,
            errors_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS player_features (
            player_id INTEGER NOT NULL,
            as_of_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            target_game_id TEXT NULL,
            season TEXT NOT NULL,
            history_games INTEGER NOT NULL,
            last_game_date TEXT NOT NULL,
            features_json TEXT NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (player_id, as_of_date, kind)
        );
        CREATE INDEX IF NOT EXISTS idx_player_features_kind_date ON player_features(kind, as_of_date);

        CREATE TABLE IF NOT EXISTS feature_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            ingest_watermark INTEGER NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS model_dataset (
            player_id INTEGER NOT NULL,
            row_key TEXT NOT NULL,
            target_date TEXT NOT NULL,
            labeled INTEGER NOT NULL,
            history_games INTEGER NOT NULL,
            features_json TEXT NOT NULL,
            label_json TEXT NULL,
            schema_fingerprint TEXT NOT NULL,
            PRIMARY KEY (player_id, row_key)
        );
        CREATE INDEX IF NOT EXISTS idx_model_dataset_labeled ON model_dataset(labeled, target_date);

        CREATE TABLE IF NOT EXISTS projections (
            player_id INTEGER NOT NULL,
            projection_date TEXT NOT NULL,
            player_name TEXT NOT NULL,
            team_abbrev TEXT NOT NULL,
            minutes REAL NOT NULL,
            rates_json TEXT NOT NULL,
            values_json TEXT NOT NULL,
            model_versions_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (player_id, projection_date)
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_date TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_error TEXT NULL
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

pub fn table_count(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get::<_, i64>(0)
    })
    .with_context(|| format!("count rows in {table}"))
}
