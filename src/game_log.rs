use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DATE_FMT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stat {
    Pts,
    Reb,
    Ast,
    Stl,
    Blk,
    Tov,
    Fg3m,
}

impl Stat {
    pub const ALL: [Stat; 7] = [
        Stat::Pts,
        Stat::Reb,
        Stat::Ast,
        Stat::Stl,
        Stat::Blk,
        Stat::Tov,
        Stat::Fg3m,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Stat::Pts => "pts",
            Stat::Reb => "reb",
            Stat::Ast => "ast",
            Stat::Stl => "stl",
            Stat::Blk => "blk",
            Stat::Tov => "tov",
            Stat::Fg3m => "fg3m",
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Stat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim().to_ascii_lowercase();
        Stat::ALL
            .iter()
            .copied()
            .find(|stat| stat.key() == s)
            .ok_or_else(|| format!("unknown stat {raw:?}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxScore {
    pub pts: f64,
    pub reb: f64,
    pub ast: f64,
    pub stl: f64,
    pub blk: f64,
    pub tov: f64,
    pub fgm: f64,
    pub fga: f64,
    pub fg3m: f64,
    pub fg3a: f64,
    pub ftm: f64,
    pub fta: f64,
    pub plus_minus: f64,
}

impl BoxScore {
    pub fn get(&self, stat: Stat) -> f64 {
        match stat {
            Stat::Pts => self.pts,
            Stat::Reb => self.reb,
            Stat::Ast => self.ast,
            Stat::Stl => self.stl,
            Stat::Blk => self.blk,
            Stat::Tov => self.tov,
            Stat::Fg3m => self.fg3m,
        }
    }

    /// Possessions used: FGA + 0.44 * FTA + TOV.
    pub fn possessions_used(&self) -> f64 {
        self.fga + 0.44 * self.fta + self.tov
    }

    fn counting(&self) -> [f64; 12] {
        [
            self.pts, self.reb, self.ast, self.stl, self.blk, self.tov, self.fgm, self.fga,
            self.fg3m, self.fg3a, self.ftm, self.fta,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameLogRecord {
    pub player_id: i64,
    pub player_name: String,
    pub game_id: String,
    pub game_date: NaiveDate,
    pub season: String,
    pub team_id: i64,
    pub team_abbrev: String,
    pub opponent_abbrev: String,
    pub is_home: bool,
    pub minutes: f64,
    pub stats: BoxScore,
}

impl GameLogRecord {
    pub fn validate(&self) -> Result<(), String> {
        if self.player_id <= 0 {
            return Err(format!("invalid player id {}", self.player_id));
        }
        if self.game_id.trim().is_empty() {
            return Err(format!("empty game id for player {}", self.player_id));
        }
        if !self.minutes.is_finite() || self.minutes < 0.0 {
            return Err(format!(
                "invalid minutes {} for player {} game {}",
                self.minutes, self.player_id, self.game_id
            ));
        }
        if self
            .stats
            .counting()
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(format!(
                "invalid counting stat for player {} game {}",
                self.player_id, self.game_id
            ));
        }
        if !self.stats.plus_minus.is_finite() {
            return Err(format!(
                "invalid plus-minus for player {} game {}",
                self.player_id, self.game_id
            ));
        }
        Ok(())
    }

    pub fn content_hash(&self) -> String {
        let raw = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(raw.as_bytes());
        format!("{digest:x}")
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, DATE_FMT)
        .ok()
        .or_else(|| NaiveDate::parse_from_str(trimmed, "%b %d, %Y").ok())
        .or_else(|| NaiveDate::parse_from_str(trimmed, "%m/%d/%Y").ok())
}

pub fn season_label(start_year: i32) -> String {
    format!("{}-{:02}", start_year, (start_year + 1).rem_euclid(100))
}

/// Seasons start in October; a January date belongs to the previous year's season.
pub fn season_for_date(date: NaiveDate) -> String {
    let year = date.year();
    if date.month() >= 10 {
        season_label(year)
    } else {
        season_label(year - 1)
    }
}

pub fn season_range(start_year: i32, end_year: i32) -> Vec<String> {
    if end_year < start_year {
        return Vec::new();
    }
    (start_year..=end_year).map(season_label).collect()
}

/// `LAL vs. BOS` is a home game, `LAL @ BOS` an away game.
pub fn parse_matchup(raw: &str) -> Option<(String, String, bool)> {
    if let Some((team, opp)) = raw.split_once(" vs. ") {
        return Some((team.trim().to_string(), opp.trim().to_string(), true));
    }
    if let Some((team, opp)) = raw.split_once(" @ ") {
        return Some((team.trim().to_string(), opp.trim().to_string(), false));
    }
    None
}
