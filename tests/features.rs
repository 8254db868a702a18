mod common;

use std::collections::BTreeMap;

use nba_projections::dataset::{build_dataset, load_current_rows, load_labeled_rows};
use nba_projections::error::PipelineError;
use nba_projections::features::{
    FeatureSchema, TargetContext, UNKNOWN_VENUE, UpdateMode, UsageIndex, compute_snapshot,
    load_snapshots_for_date, load_training_snapshots, project_snapshots, rebuild_all,
    update_incremental,
};
use nba_projections::game_log::{GameLogRecord, Stat};
use nba_projections::ledger::{ingest, load_player_history};
use nba_projections::projection::{ProjectionRecord, save_projections};
use nba_projections::provider::ScheduledGame;
use nba_projections::store::open_in_memory;

use common::{date, league, log};

fn schema() -> FeatureSchema {
    FeatureSchema::new(&[3, 5, 10], &[Stat::Pts, Stat::Reb, Stat::Ast])
}

fn ten_games() -> Vec<GameLogRecord> {
    let minutes = [20.0, 22.0, 25.0, 18.0, 30.0, 28.0, 24.0, 26.0, 19.0, 21.0];
    minutes
        .iter()
        .enumerate()
        .map(|(i, m)| log(7, "AAA", &format!("g{:02}", i + 1), date(2023, 11, 1 + 2 * i as u32), *m))
        .collect()
}

#[test]
fn rolling_window_over_ten_prior_games() {
    let mut conn = open_in_memory().unwrap();
    let mut rows = ten_games();
    // Last prior game on Nov 19, target on Nov 22.
    rows.push(log(7, "AAA", "g11", date(2023, 11, 22), 33.0));
    ingest(&mut conn, "seed", rows).unwrap();

    let schema = schema();
    rebuild_all(&mut conn, &schema).unwrap();
    let snaps = load_training_snapshots(&conn, &schema).unwrap();
    let snap = snaps
        .iter()
        .find(|s| s.target_game_id.as_deref() == Some("g11"))
        .expect("snapshot for the 11th game");

    assert_eq!(snap.history_games, 10);
    let roll5 = snap.value(&schema, "min_roll_5").unwrap();
    assert!((roll5 - 23.6).abs() < 1e-9, "got {roll5}");
    let roll10 = snap.value(&schema, "min_roll_10").unwrap();
    assert!((roll10 - 23.3).abs() < 1e-9, "got {roll10}");
    assert_eq!(snap.value(&schema, "days_rest"), Some(3.0));
    assert_eq!(snap.value(&schema, "season_game_index"), Some(11.0));
}

#[test]
fn later_games_do_not_leak_into_earlier_snapshots() {
    let schema = schema();
    let history = ten_games();
    let usage = UsageIndex::from_records(&history);
    let target = TargetContext {
        player_id: 7,
        date: date(2023, 11, 15),
        game_id: Some("g08".to_string()),
        season: "2023-24".to_string(),
        is_home: Some(true),
    };
    let before = compute_snapshot(&schema, &history[..7], &usage, &target).unwrap();

    let mut extended = history.clone();
    extended.push(log(7, "AAA", "g99", date(2023, 12, 30), 48.0));
    let usage = UsageIndex::from_records(&extended);
    let after = compute_snapshot(&schema, &extended, &usage, &target).unwrap();
    assert_eq!(before, after);
    assert_eq!(after.history_games, 7);
}

#[test]
fn rebuilds_are_deterministic() {
    let mut conn = open_in_memory().unwrap();
    ingest(&mut conn, "seed", league(date(2023, 11, 1), 12)).unwrap();
    let schema = schema();

    rebuild_all(&mut conn, &schema).unwrap();
    let first = load_training_snapshots(&conn, &schema).unwrap();
    rebuild_all(&mut conn, &schema).unwrap();
    let second = load_training_snapshots(&conn, &schema).unwrap();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

fn batches() -> [Vec<GameLogRecord>; 3] {
    let all = league(date(2023, 11, 1), 15);
    let cutoff = date(2023, 11, 21);
    let (first, mut second): (Vec<_>, Vec<_>) = all.into_iter().partition(|r| r.game_date < cutoff);

    // New games plus a team reassignment for a game already ingested.
    let mut moved = first
        .iter()
        .find(|r| r.player_id == 100 && r.game_date == date(2023, 11, 11))
        .cloned()
        .unwrap();
    moved.team_abbrev = "BBB".to_string();
    second.push(moved);

    // A stat correction that only touches one side of one game.
    let mut fixed = first
        .iter()
        .find(|r| r.player_id == 203 && r.game_date == date(2023, 11, 5))
        .cloned()
        .unwrap();
    fixed.stats.pts += 5.0;
    fixed.stats.fga += 3.0;
    [first, second, vec![fixed]]
}

#[test]
fn incremental_update_matches_full_rebuild() {
    let schema = schema();
    let [first, second, third] = batches();

    let mut incremental = open_in_memory().unwrap();
    ingest(&mut incremental, "first", first.clone()).unwrap();
    let initial = update_incremental(&mut incremental, &schema).unwrap();
    assert_eq!(initial.mode, UpdateMode::Full);

    ingest(&mut incremental, "second", second.clone()).unwrap();
    let update = update_incremental(&mut incremental, &schema).unwrap();
    assert_eq!(update.mode, UpdateMode::Incremental);
    assert_eq!(update.players, 10);

    ingest(&mut incremental, "third", third.clone()).unwrap();
    let update = update_incremental(&mut incremental, &schema).unwrap();
    assert_eq!(update.mode, UpdateMode::Incremental);
    // Only the BBB side of that game shares the corrected team total.
    assert_eq!(update.players, 5);

    let mut full = open_in_memory().unwrap();
    ingest(&mut full, "first", first).unwrap();
    ingest(&mut full, "second", second).unwrap();
    ingest(&mut full, "third", third).unwrap();
    rebuild_all(&mut full, &schema).unwrap();

    assert_eq!(
        load_training_snapshots(&incremental, &schema).unwrap(),
        load_training_snapshots(&full, &schema).unwrap()
    );

    let idle = update_incremental(&mut incremental, &schema).unwrap();
    assert_eq!(idle.mode, UpdateMode::Incremental);
    assert_eq!(idle.players, 0);
}

#[test]
fn schema_change_forces_full_rebuild() {
    let mut conn = open_in_memory().unwrap();
    ingest(&mut conn, "seed", league(date(2023, 11, 1), 4)).unwrap();
    update_incremental(&mut conn, &schema()).unwrap();

    let wider = FeatureSchema::new(&[3, 5, 10, 20], &[Stat::Pts, Stat::Reb, Stat::Ast]);
    let update = update_incremental(&mut conn, &wider).unwrap();
    assert_eq!(update.mode, UpdateMode::Full);
    assert!(load_training_snapshots(&conn, &schema()).unwrap().is_empty());
    assert!(!load_training_snapshots(&conn, &wider).unwrap().is_empty());
}

#[test]
fn debut_games_are_excluded_from_training() {
    let mut conn = open_in_memory().unwrap();
    let mut rows = league(date(2023, 11, 1), 4);
    rows.push(log(999, "AAA", "0022300003", date(2023, 11, 7), 12.0));
    ingest(&mut conn, "seed", rows).unwrap();

    let schema = schema();
    let history = load_player_history(&conn, 999).unwrap();
    let usage = UsageIndex::default();
    let target = TargetContext {
        player_id: 999,
        date: date(2023, 11, 7),
        game_id: Some("0022300003".to_string()),
        season: "2023-24".to_string(),
        is_home: Some(true),
    };
    let err = compute_snapshot(&schema, &history, &usage, &target).unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientHistory { player_id: 999, prior_games: 0, .. }));

    let update = rebuild_all(&mut conn, &schema).unwrap();
    assert_eq!(update.insufficient, 11);
    let summary = build_dataset(&mut conn, &schema, 2, None).unwrap();
    let rows = load_labeled_rows(&conn, &schema, None).unwrap();
    assert!(rows.iter().all(|r| r.player_id != 999));
    assert!(rows.iter().all(|r| r.history_games >= 2));
    // Ten regulars: one-game histories on day 2 fall below the minimum.
    assert_eq!(summary.excluded_history, 10);
    assert_eq!(summary.labeled, 20);
}

#[test]
fn projection_snapshots_cover_active_players() {
    let mut conn = open_in_memory().unwrap();
    ingest(&mut conn, "seed", league(date(2023, 11, 1), 6)).unwrap();
    let schema = schema();
    rebuild_all(&mut conn, &schema).unwrap();

    let day = date(2023, 11, 20);
    let slate = vec![ScheduledGame {
        game_id: "0022300777".to_string(),
        game_date: day,
        home_abbrev: "AAA".to_string(),
        away_abbrev: "CCC".to_string(),
    }];
    let out = project_snapshots(&mut conn, &schema, day, &slate).unwrap();
    assert_eq!(out.snapshots.len(), 10);
    assert!(out.excluded.is_empty());

    for snap in &out.snapshots {
        let is_home = snap.value(&schema, "is_home").unwrap();
        if snap.player_id < 200 {
            assert_eq!(is_home, 1.0);
            assert_eq!(snap.target_game_id.as_deref(), Some("0022300777"));
        } else {
            assert_eq!(is_home, UNKNOWN_VENUE);
            assert_eq!(snap.target_game_id, None);
        }
    }
    assert_eq!(load_snapshots_for_date(&conn, &schema, day).unwrap(), out.snapshots);

    let summary = build_dataset(&mut conn, &schema, 2, Some(day)).unwrap();
    assert_eq!(summary.unlabeled, 10);
    let current = load_current_rows(&conn, &schema, day).unwrap();
    assert_eq!(current.len(), 10);
    assert!(current.iter().all(|r| r.label.is_none() && r.row_key == "upcoming:2023-11-20"));
}

#[test]
fn projecting_a_played_date_keeps_training_snapshots() {
    let schema = schema();
    let all = league(date(2023, 11, 1), 12);
    let (early, late): (Vec<_>, Vec<_>) = all.into_iter().partition(|r| r.game_date < date(2023, 11, 21));

    let mut conn = open_in_memory().unwrap();
    ingest(&mut conn, "early", early.clone()).unwrap();
    rebuild_all(&mut conn, &schema).unwrap();
    let before = load_training_snapshots(&conn, &schema).unwrap();

    // Nov 19 already has games in the ledger; one slate-backed, one without a slate.
    let slate = vec![ScheduledGame {
        game_id: "0022300009".to_string(),
        game_date: date(2023, 11, 19),
        home_abbrev: "AAA".to_string(),
        away_abbrev: "BBB".to_string(),
    }];
    project_snapshots(&mut conn, &schema, date(2023, 11, 19), &slate).unwrap();
    project_snapshots(&mut conn, &schema, date(2023, 11, 19), &[]).unwrap();
    assert_eq!(load_training_snapshots(&conn, &schema).unwrap(), before);
    assert_eq!(load_snapshots_for_date(&conn, &schema, date(2023, 11, 19)).unwrap().len(), 10);

    ingest(&mut conn, "late", late.clone()).unwrap();
    let update = update_incremental(&mut conn, &schema).unwrap();
    assert_eq!(update.mode, UpdateMode::Incremental);

    let mut full = open_in_memory().unwrap();
    ingest(&mut full, "early", early).unwrap();
    ingest(&mut full, "late", late).unwrap();
    rebuild_all(&mut full, &schema).unwrap();
    assert_eq!(
        load_training_snapshots(&conn, &schema).unwrap(),
        load_training_snapshots(&full, &schema).unwrap()
    );

    let incremental = build_dataset(&mut conn, &schema, 2, None).unwrap();
    let rebuilt = build_dataset(&mut full, &schema, 2, None).unwrap();
    assert_eq!(incremental, rebuilt);
    assert_eq!(incremental.missing_games, 0);
}

#[test]
fn projected_dates_are_pruned_on_the_next_projection() {
    let schema = schema();
    let mut conn = open_in_memory().unwrap();
    ingest(&mut conn, "seed", league(date(2023, 11, 1), 6)).unwrap();
    rebuild_all(&mut conn, &schema).unwrap();

    project_snapshots(&mut conn, &schema, date(2023, 11, 12), &[]).unwrap();
    project_snapshots(&mut conn, &schema, date(2023, 11, 13), &[]).unwrap();
    let stored = ProjectionRecord {
        player_id: 100,
        player_name: "Player 100".to_string(),
        team_abbrev: "AAA".to_string(),
        projection_date: date(2023, 11, 12),
        minutes: 20.0,
        rates: BTreeMap::new(),
        values: BTreeMap::new(),
        model_versions: BTreeMap::new(),
    };
    save_projections(&mut conn, date(2023, 11, 12), &[stored]).unwrap();

    project_snapshots(&mut conn, &schema, date(2023, 11, 14), &[]).unwrap();
    assert!(load_snapshots_for_date(&conn, &schema, date(2023, 11, 12)).unwrap().is_empty());
    // Never projected, so kept for a later dataset build.
    assert_eq!(load_snapshots_for_date(&conn, &schema, date(2023, 11, 13)).unwrap().len(), 10);
    assert_eq!(load_snapshots_for_date(&conn, &schema, date(2023, 11, 14)).unwrap().len(), 10);
}
