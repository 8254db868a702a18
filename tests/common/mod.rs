#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use chrono::NaiveDate;

use nba_projections::error::FetchError;
use nba_projections::game_log::{BoxScore, GameLogRecord, season_for_date};
use nba_projections::provider::{ScheduledGame, StatsProvider};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// One box score line; counting stats scale with minutes so rates stay realistic.
pub fn log(player_id: i64, team: &str, game_id: &str, day: NaiveDate, minutes: f64) -> GameLogRecord {
    let m = minutes;
    GameLogRecord {
        player_id,
        player_name: format!("Player {player_id}"),
        game_id: game_id.to_string(),
        game_date: day,
        season: season_for_date(day),
        team_id: team.bytes().map(i64::from).sum(),
        team_abbrev: team.to_string(),
        opponent_abbrev: "OPP".to_string(),
        is_home: game_id.bytes().last().is_some_and(|b| b % 2 == 0),
        minutes,
        stats: BoxScore {
            pts: (m * 0.5 + (player_id % 5) as f64).round(),
            reb: (m * 0.2).round(),
            ast: (m * 0.1 + (player_id % 3) as f64).round(),
            stl: (m * 0.03).round(),
            blk: (m * 0.02).round(),
            tov: (m * 0.05).round(),
            fgm: (m * 0.2).round(),
            fga: (m * 0.4).round(),
            fg3m: (m * 0.05).round(),
            fg3a: (m * 0.12).round(),
            ftm: (m * 0.08).round(),
            fta: (m * 0.1).round(),
            plus_minus: 0.0,
        },
    }
}

/// A small two-team league: `days` game days starting at `start`, five players a side.
pub fn league(start: NaiveDate, days: u64) -> Vec<GameLogRecord> {
    let mut out = Vec::new();
    for d in 0..days {
        let day = start + chrono::Days::new(d * 2);
        let game_id = format!("00223{:05}", d);
        for (team, base) in [("AAA", 100), ("BBB", 200)] {
            for slot in 0..5i64 {
                let player_id = base + slot;
                let minutes = 14.0 + (slot as f64) * 4.0 + ((d as i64 * 7 + slot * 3) % 9) as f64;
                out.push(log(player_id, team, &game_id, day, minutes));
            }
        }
    }
    out
}

/// Provider that replays canned responses and records what was asked.
#[derive(Default)]
pub struct ScriptedProvider {
    pub seasons: HashMap<String, Vec<GameLogRecord>>,
    pub days: RefCell<HashMap<NaiveDate, VecDeque<Result<Vec<GameLogRecord>, FetchError>>>>,
    pub slates: HashMap<NaiveDate, Vec<ScheduledGame>>,
    pub failing_seasons: HashMap<String, FetchError>,
    pub failing_slates: HashMap<NaiveDate, FetchError>,
    pub calls: RefCell<Vec<String>>,
}

impl ScriptedProvider {
    pub fn with_season(mut self, season: &str, rows: Vec<GameLogRecord>) -> Self {
        self.seasons.insert(season.to_string(), rows);
        self
    }

    pub fn push_day(&self, day: NaiveDate, response: Result<Vec<GameLogRecord>, FetchError>) {
        self.days.borrow_mut().entry(day).or_default().push_back(response);
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl StatsProvider for ScriptedProvider {
    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRecord>, FetchError> {
        self.calls.borrow_mut().push(format!("season {season}"));
        if let Some(err) = self.failing_seasons.get(season) {
            return Err(err.clone());
        }
        Ok(self.seasons.get(season).cloned().unwrap_or_default())
    }

    fn fetch_player_season(&self, player_id: i64, season: &str) -> Result<Vec<GameLogRecord>, FetchError> {
        self.calls.borrow_mut().push(format!("player {player_id} {season}"));
        Ok(self
            .seasons
            .get(season)
            .map(|rows| rows.iter().filter(|r| r.player_id == player_id).cloned().collect())
            .unwrap_or_default())
    }

    fn fetch_day(&self, day: NaiveDate) -> Result<Vec<GameLogRecord>, FetchError> {
        self.calls.borrow_mut().push(format!("day {day}"));
        self.days
            .borrow_mut()
            .get_mut(&day)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn fetch_scoreboard(&self, day: NaiveDate) -> Result<Vec<ScheduledGame>, FetchError> {
        self.calls.borrow_mut().push(format!("scoreboard {day}"));
        if let Some(err) = self.failing_slates.get(&day) {
            return Err(err.clone());
        }
        Ok(self.slates.get(&day).cloned().unwrap_or_default())
    }
}

pub mod setup {
    use chrono::NaiveDate;
    use rusqlite::Connection;

    use nba_projections::config::TrainingParams;
    use nba_projections::dataset::build_dataset;
    use nba_projections::features::{FeatureSchema, project_snapshots, rebuild_all};
    use nba_projections::game_log::Stat;
    use nba_projections::ledger::ingest;
    use nba_projections::store::open_in_memory;

    use super::{date, league};

    pub const MIN_HISTORY: usize = 3;

    pub fn schema() -> FeatureSchema {
        FeatureSchema::new(&[3, 5, 10], &[Stat::Pts, Stat::Reb, Stat::Ast])
    }

    pub fn params() -> TrainingParams {
        TrainingParams {
            max_iters: 400,
            ..TrainingParams::default()
        }
    }

    /// Thirty game days from Nov 1 (last on Dec 29) with snapshots and dataset built
    /// for `projection_date`.
    pub fn seeded(schema: &FeatureSchema, projection_date: NaiveDate) -> Connection {
        let mut conn = open_in_memory().expect("in-memory db");
        ingest(&mut conn, "seed", league(date(2023, 11, 1), 30)).expect("ingest");
        rebuild_all(&mut conn, schema).expect("features");
        project_snapshots(&mut conn, schema, projection_date, &[]).expect("projection snapshots");
        build_dataset(&mut conn, schema, MIN_HISTORY, Some(projection_date)).expect("dataset");
        conn
    }
}
