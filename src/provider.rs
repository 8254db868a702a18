use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::FetchError;
use crate::game_log::{BoxScore, GameLogRecord, parse_date, parse_matchup, season_for_date};
use crate::http_client::http_client;

const STATS_BASE_URL: &str = "https://stats.nba.com/stats";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledGame {
    pub game_id: String,
    pub game_date: NaiveDate,
    pub home_abbrev: String,
    pub away_abbrev: String,
}

pub trait StatsProvider {
    /// League-wide regular-season logs for one season.
    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRecord>, FetchError>;

    fn fetch_player_season(
        &self,
        player_id: i64,
        season: &str,
    ) -> Result<Vec<GameLogRecord>, FetchError>;

    fn fetch_day(&self, date: NaiveDate) -> Result<Vec<GameLogRecord>, FetchError>;

    fn fetch_scoreboard(&self, _date: NaiveDate) -> Result<Vec<ScheduledGame>, FetchError> {
        Ok(Vec::new())
    }
}

pub struct HttpStatsProvider {
    client: &'static Client,
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl HttpStatsProvider {
    pub fn new(request_interval_ms: u64) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            interval: Duration::from_millis(request_interval_ms),
            last_request: Mutex::new(None),
        })
    }

    fn throttle(&self) {
        let Ok(mut guard) = self.last_request.lock() else {
            return;
        };
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        *guard = Some(Instant::now());
    }

    fn get_json(&self, url: &str) -> Result<String, FetchError> {
        self.throttle();
        let resp = self.client.get(url).send().map_err(|err| {
            if err.is_timeout() || err.is_connect() || err.is_request() {
                FetchError::Transient(format!("request {url}: {err}"))
            } else {
                FetchError::Permanent(format!("request {url}: {err}"))
            }
        })?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|err| FetchError::Transient(format!("read body {url}: {err}")))?;
        if status.is_success() {
            return Ok(body);
        }
        let message = format!("http {status} for {url}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(FetchError::Transient(message))
        } else {
            Err(FetchError::Permanent(message))
        }
    }
}

impl StatsProvider for HttpStatsProvider {
    fn fetch_season(&self, season: &str) -> Result<Vec<GameLogRecord>, FetchError> {
        let url = format!(
            "{STATS_BASE_URL}/leaguegamelog?Counter=0&Direction=ASC&LeagueID=00&PlayerOrTeam=P&Season={season}&SeasonType=Regular%20Season&Sorter=DATE"
        );
        let body = self.get_json(&url)?;
        parse_game_log_json(&body, season, None).map_err(FetchError::Permanent)
    }

    fn fetch_player_season(
        &self,
        player_id: i64,
        season: &str,
    ) -> Result<Vec<GameLogRecord>, FetchError> {
        let url = format!(
            "{STATS_BASE_URL}/playergamelog?PlayerID={player_id}&Season={season}&SeasonType=Regular%20Season&LeagueID=00"
        );
        let body = self.get_json(&url)?;
        parse_game_log_json(&body, season, Some(player_id)).map_err(FetchError::Permanent)
    }

    fn fetch_day(&self, date: NaiveDate) -> Result<Vec<GameLogRecord>, FetchError> {
        let season = season_for_date(date);
        let day = date.format("%m/%d/%Y").to_string().replace('/', "%2F");
        let url = format!(
            "{STATS_BASE_URL}/leaguegamelog?Counter=0&Direction=ASC&LeagueID=00&PlayerOrTeam=P&Season={season}&SeasonType=Regular%20Season&Sorter=DATE&DateFrom={day}&DateTo={day}"
        );
        let body = self.get_json(&url)?;
        let rows = parse_game_log_json(&body, &season, None).map_err(FetchError::Permanent)?;
        Ok(rows.into_iter().filter(|r| r.game_date == date).collect())
    }

    fn fetch_scoreboard(&self, date: NaiveDate) -> Result<Vec<ScheduledGame>, FetchError> {
        let day = date.format("%m/%d/%Y").to_string().replace('/', "%2F");
        let url = format!("{STATS_BASE_URL}/scoreboardv2?DayOffset=0&LeagueID=00&GameDate={day}");
        let body = self.get_json(&url)?;
        parse_scoreboard_json(&body, date).map_err(FetchError::Permanent)
    }
}

// Player logs carry no player identity, so `player_id` fills it in.
pub fn parse_game_log_json(
    raw: &str,
    season: &str,
    player_id: Option<i64>,
) -> Result<Vec<GameLogRecord>, String> {
    let value = serde_json::from_str::<Value>(raw.trim())
        .map_err(|err| format!("invalid game log json: {err}"))?;
    let rows = result_set_rows(&value, None)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(record) = parse_game_log_row(&row, season, player_id) {
            out.push(record);
        }
    }
    Ok(out)
}

pub fn parse_scoreboard_json(raw: &str, date: NaiveDate) -> Result<Vec<ScheduledGame>, String> {
    let value = serde_json::from_str::<Value>(raw.trim())
        .map_err(|err| format!("invalid scoreboard json: {err}"))?;
    let rows = result_set_rows(&value, Some("GameHeader"))?;
    let mut out = Vec::new();
    for row in rows {
        let Some(game_id) = row.get("GAME_ID").and_then(as_string_any) else {
            continue;
        };
        // GAMECODE is `YYYYMMDD/AWAYHOME`.
        let Some(code) = row
            .get("GAMECODE")
            .and_then(|v| v.as_str())
            .and_then(|s| s.split_once('/'))
            .map(|(_, teams)| teams.to_string())
        else {
            continue;
        };
        if code.len() != 6 || !code.is_ascii() {
            continue;
        }
        out.push(ScheduledGame {
            game_id,
            game_date: date,
            away_abbrev: code[..3].to_string(),
            home_abbrev: code[3..].to_string(),
        });
    }
    Ok(out)
}

fn result_set_rows(value: &Value, name: Option<&str>) -> Result<Vec<HashMap<String, Value>>, String> {
    let sets = value
        .get("resultSets")
        .or_else(|| value.get("resultSet"))
        .ok_or_else(|| "missing resultSets".to_string())?;
    let set = match sets {
        Value::Array(items) => match name {
            Some(name) => items
                .iter()
                .find(|s| s.get("name").and_then(|n| n.as_str()) == Some(name)),
            None => items.first(),
        },
        other => Some(other),
    }
    .ok_or_else(|| format!("missing result set {}", name.unwrap_or("#0")))?;

    let headers = set
        .get("headers")
        .and_then(|h| h.as_array())
        .ok_or_else(|| "missing headers".to_string())?
        .iter()
        .map(|h| h.as_str().unwrap_or_default().to_ascii_uppercase())
        .collect::<Vec<_>>();
    let row_set = set
        .get("rowSet")
        .and_then(|r| r.as_array())
        .ok_or_else(|| "missing rowSet".to_string())?;

    let mut out = Vec::with_capacity(row_set.len());
    for row in row_set {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let map = headers
            .iter()
            .cloned()
            .zip(cells.iter().cloned())
            .collect::<HashMap<_, _>>();
        out.push(map);
    }
    Ok(out)
}

fn parse_game_log_row(
    row: &HashMap<String, Value>,
    season: &str,
    fallback_player_id: Option<i64>,
) -> Option<GameLogRecord> {
    let player_id = row
        .get("PLAYER_ID")
        .and_then(as_i64_any)
        .or(fallback_player_id)?;
    let game_id = row.get("GAME_ID").and_then(as_string_any)?;
    let game_date = row
        .get("GAME_DATE")
        .and_then(|v| v.as_str())
        .and_then(parse_date)?;
    let matchup = row.get("MATCHUP").and_then(|v| v.as_str()).unwrap_or_default();
    let (team_from_matchup, opponent_abbrev, is_home) = parse_matchup(matchup)?;
    let team_abbrev = row
        .get("TEAM_ABBREVIATION")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or(team_from_matchup);
    let player_name = row
        .get("PLAYER_NAME")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("player {player_id}"));

    let num = |key: &str| row.get(key).and_then(as_f64_any).unwrap_or(0.0);
    let stats = BoxScore {
        pts: num("PTS"),
        reb: num("REB"),
        ast: num("AST"),
        stl: num("STL"),
        blk: num("BLK"),
        tov: num("TOV"),
        fgm: num("FGM"),
        fga: num("FGA"),
        fg3m: num("FG3M"),
        fg3a: num("FG3A"),
        ftm: num("FTM"),
        fta: num("FTA"),
        plus_minus: num("PLUS_MINUS"),
    };

    Some(GameLogRecord {
        player_id,
        player_name,
        game_id,
        game_date,
        season: season.to_string(),
        team_id: row.get("TEAM_ID").and_then(as_i64_any).unwrap_or(0),
        team_abbrev,
        opponent_abbrev,
        is_home,
        minutes: row.get("MIN").and_then(parse_minutes).unwrap_or(0.0),
        stats,
    })
}

// Number or `MM:SS`.
fn parse_minutes(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    let s = v.as_str()?.trim();
    if let Some((m, sec)) = s.split_once(':') {
        let m = m.trim().parse::<f64>().ok()?;
        let sec = sec.trim().parse::<f64>().ok()?;
        return Some(m + sec / 60.0);
    }
    s.parse::<f64>().ok()
}

fn as_f64_any(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str()?.trim().parse::<f64>().ok()
}

fn as_i64_any(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    v.as_str()?.trim().parse::<i64>().ok()
}

fn as_string_any(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
