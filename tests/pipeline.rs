mod common;

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use rusqlite::Connection;

use nba_projections::config::PipelineConfig;
use nba_projections::error::FetchError;
use nba_projections::export::CSV_FILE;
use nba_projections::game_log::{GameLogRecord, Stat};
use nba_projections::ledger::ingest;
use nba_projections::pipeline::{PipelineContext, Stage, fetch_slate, run_daily, run_status};
use nba_projections::provider::ScheduledGame;
use nba_projections::projection::load_projections;
use nba_projections::retry::RetryPolicy;
use nba_projections::store::open_in_memory;

use common::setup::{MIN_HISTORY, params};
use common::{ScriptedProvider, date, league};

fn run_date() -> NaiveDate {
    date(2024, 1, 1)
}

/// Ledger through Dec 29; the provider serves Dec 31 as "yesterday".
fn seeded() -> (Connection, ScriptedProvider) {
    let all = league(date(2023, 11, 1), 31);
    let (seed, last): (Vec<GameLogRecord>, Vec<GameLogRecord>) =
        all.into_iter().partition(|r| r.game_date < date(2023, 12, 31));
    let mut conn = open_in_memory().unwrap();
    ingest(&mut conn, "seed", seed).unwrap();

    let provider = ScriptedProvider::default();
    provider.push_day(date(2023, 12, 31), Ok(last));
    (conn, provider)
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        model_dir: root.join("models"),
        output_dir: root.join("out"),
        windows: vec![3, 5, 10],
        tracked_stats: vec![Stat::Pts, Stat::Reb, Stat::Ast],
        min_history_games: MIN_HISTORY,
        training: params(),
        retry: RetryPolicy::no_backoff(2),
        ..PipelineConfig::default()
    }
}

#[test]
fn daily_run_completes_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let (mut conn, provider) = seeded();
    let ctx = PipelineContext::new(&cfg, &provider);

    let report = run_daily(&mut conn, &ctx, run_date(), false).unwrap();
    assert_eq!(
        report.completed,
        vec![
            Stage::Ingested,
            Stage::FeaturesUpdated,
            Stage::DatasetReady,
            Stage::ModelsReady,
            Stage::Projected,
        ]
    );
    assert_eq!(report.projections, 10);
    assert_eq!(provider.call_count("day 2023-12-31"), 1);

    let status = run_status(&conn, run_date()).unwrap().expect("status");
    assert_eq!(status.stage, Stage::Projected);
    assert_eq!(status.last_error, None);

    let csv = fs::read_to_string(cfg.output_dir.join(CSV_FILE)).unwrap();
    let lines = csv.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 11);
    assert!(lines[0].starts_with("player_id,player_name,team,date,minutes"));
    assert_eq!(load_projections(&conn, run_date()).unwrap().len(), 10);
}

#[test]
fn finished_runs_are_not_repeated() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let (mut conn, provider) = seeded();
    let ctx = PipelineContext::new(&cfg, &provider);

    run_daily(&mut conn, &ctx, run_date(), false).unwrap();
    let projections = load_projections(&conn, run_date()).unwrap();

    let again = run_daily(&mut conn, &ctx, run_date(), false).unwrap();
    assert!(again.completed.is_empty());
    assert_eq!(provider.call_count("day"), 1);
    assert_eq!(load_projections(&conn, run_date()).unwrap(), projections);
}

#[test]
fn failed_stage_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.training.min_train_rows = 1_000_000;
    let (mut conn, provider) = seeded();

    {
        let ctx = PipelineContext::new(&cfg, &provider);
        assert!(run_daily(&mut conn, &ctx, run_date(), false).is_err());
    }
    let status = run_status(&conn, run_date()).unwrap().expect("status");
    assert_eq!(status.stage, Stage::DatasetReady);
    assert!(status.last_error.as_deref().is_some_and(|e| e.starts_with("models_ready")));
    assert!(load_projections(&conn, run_date()).unwrap().is_empty());

    cfg.training = params();
    let ctx = PipelineContext::new(&cfg, &provider);
    let report = run_daily(&mut conn, &ctx, run_date(), false).unwrap();
    assert_eq!(report.completed, vec![Stage::ModelsReady, Stage::Projected]);
    assert_eq!(provider.call_count("day"), 1);

    let status = run_status(&conn, run_date()).unwrap().expect("status");
    assert_eq!(status.stage, Stage::Projected);
    assert_eq!(status.last_error, None);
}

#[test]
fn restart_runs_every_stage_again() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let (mut conn, provider) = seeded();
    let ctx = PipelineContext::new(&cfg, &provider);

    run_daily(&mut conn, &ctx, run_date(), false).unwrap();
    let report = run_daily(&mut conn, &ctx, run_date(), true).unwrap();
    assert_eq!(report.completed.len(), 5);
    assert_eq!(report.projections, 10);
    assert_eq!(provider.call_count("day"), 2);
}

#[test]
fn failed_scoreboard_gives_an_empty_slate() {
    let mut provider = ScriptedProvider::default();
    provider
        .failing_slates
        .insert(run_date(), FetchError::Transient("503".to_string()));
    let slate = fetch_slate(&provider, &RetryPolicy::no_backoff(3), run_date());
    assert!(slate.is_empty());
    assert_eq!(provider.call_count("scoreboard"), 3);

    provider.failing_slates.clear();
    let game = ScheduledGame {
        game_id: "0022300500".to_string(),
        game_date: run_date(),
        home_abbrev: "AAA".to_string(),
        away_abbrev: "BBB".to_string(),
    };
    provider.slates.insert(run_date(), vec![game.clone()]);
    assert_eq!(fetch_slate(&provider, &RetryPolicy::no_backoff(3), run_date()), vec![game]);
}

#[test]
fn daily_run_survives_a_failed_scoreboard() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let (mut conn, mut provider) = seeded();
    provider
        .failing_slates
        .insert(run_date(), FetchError::Permanent("bad payload".to_string()));
    let ctx = PipelineContext::new(&cfg, &provider);

    let report = run_daily(&mut conn, &ctx, run_date(), false).unwrap();
    assert_eq!(report.completed.len(), 5);
    assert_eq!(report.projections, 10);
    assert_eq!(provider.call_count("scoreboard"), 1);
}
