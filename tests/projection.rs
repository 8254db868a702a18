mod common;

use std::collections::{BTreeMap, HashMap};
use std::fs;

use nba_projections::dataset::DatasetRow;
use nba_projections::error::PipelineError;
use nba_projections::export::{CSV_FILE, export};
use nba_projections::features::FeatureSchema;
use nba_projections::game_log::Stat;
use nba_projections::model::{ARTIFACT_FORMAT_VERSION, MAX_MINUTES, ModelArtifact, ModelTarget, TrainingMetadata};
use nba_projections::projection::{PlayerInfo, compose, load_projections, project};
use nba_projections::training::{ModelRegistry, ModelSet, train_all};

use common::date;
use common::setup::{params, schema, seeded};

fn trained(schema: &FeatureSchema) -> (rusqlite::Connection, tempfile::TempDir, ModelRegistry) {
    let conn = seeded(schema, date(2024, 1, 2));
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(dir.path());
    let report = train_all(&conn, schema, &registry, &params(), None).unwrap();
    assert_eq!(report.trained(), 4);
    (conn, dir, registry)
}

#[test]
fn stored_values_are_minutes_times_rate() {
    let schema = schema();
    let (mut conn, _dir, registry) = trained(&schema);
    let day = date(2024, 1, 2);

    let records = project(&mut conn, &schema, &registry, day).unwrap();
    assert_eq!(records.len(), 10);

    let stored = load_projections(&conn, day).unwrap();
    assert_eq!(stored, records);
    for r in &stored {
        assert!((0.0..=MAX_MINUTES).contains(&r.minutes));
        assert_eq!(r.values.len(), 3);
        for (stat, rate) in &r.rates {
            assert!(*rate >= 0.0);
            assert_eq!(r.values[stat], r.minutes * rate);
        }
        assert!(r.model_versions.contains_key("minutes"));
    }
}

#[test]
fn reprojecting_is_deterministic_and_replaces_the_day() {
    let schema = schema();
    let (mut conn, dir, registry) = trained(&schema);
    let day = date(2024, 1, 2);
    let stats = schema.stats().to_vec();

    let first = project(&mut conn, &schema, &registry, day).unwrap();
    let first_out = dir.path().join("first");
    export(&first_out, &first, &stats, Stat::Pts, false).unwrap();

    let second = project(&mut conn, &schema, &registry, day).unwrap();
    let second_out = dir.path().join("second");
    export(&second_out, &second, &stats, Stat::Pts, false).unwrap();

    assert_eq!(first, second);
    assert_eq!(load_projections(&conn, day).unwrap(), second);
    assert_eq!(
        fs::read(first_out.join(CSV_FILE)).unwrap(),
        fs::read(second_out.join(CSV_FILE)).unwrap()
    );
}

fn republish_with_columns(registry: &ModelRegistry, target: ModelTarget, columns: Vec<String>) {
    let mut artifact = registry.load(target).unwrap().expect("artifact");
    artifact.feature_columns = columns;
    artifact.model_version = format!("{}-edited", artifact.model_version);
    registry.publish(&artifact).unwrap();
}

#[test]
fn mismatched_rate_model_drops_only_its_stat() {
    let schema = schema();
    let (mut conn, _dir, registry) = trained(&schema);
    let mut reversed = schema.columns().to_vec();
    reversed.reverse();
    republish_with_columns(&registry, ModelTarget::Rate(Stat::Ast), reversed);

    let records = project(&mut conn, &schema, &registry, date(2024, 1, 2)).unwrap();
    assert_eq!(records.len(), 10);
    for r in &records {
        assert!(r.value(Stat::Ast).is_none());
        assert!(r.value(Stat::Pts).is_some());
        assert!(r.value(Stat::Reb).is_some());
    }
}

#[test]
fn mismatched_minutes_model_aborts_without_touching_stored_rows() {
    let schema = schema();
    let (mut conn, _dir, registry) = trained(&schema);
    let day = date(2024, 1, 2);
    let before = project(&mut conn, &schema, &registry, day).unwrap();

    let mut columns = schema.columns().to_vec();
    columns.pop();
    republish_with_columns(&registry, ModelTarget::Minutes, columns);

    let err = project(&mut conn, &schema, &registry, day).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::SchemaMismatch { .. })
    ));
    assert_eq!(load_projections(&conn, day).unwrap(), before);
}

#[test]
fn missing_minutes_model_is_an_error() {
    let schema = schema();
    let mut conn = seeded(&schema, date(2024, 1, 2));
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(dir.path());
    assert!(project(&mut conn, &schema, &registry, date(2024, 1, 2)).is_err());
}

fn constant_model(schema: &FeatureSchema, target: ModelTarget, value: f64, clip_max: Option<f64>) -> ModelArtifact {
    let width = schema.columns().len();
    ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        target,
        model_version: "fixed".to_string(),
        feature_columns: schema.columns().to_vec(),
        schema_fingerprint: schema.fingerprint(),
        feature_means: vec![0.0; width],
        feature_stds: vec![1.0; width],
        coeffs: vec![0.0; width],
        intercept: value,
        clip_min: 0.0,
        clip_max,
        metadata: TrainingMetadata {
            trained_at: "2024-01-01T00:00:00Z".to_string(),
            data_through: None,
            train_samples: 0,
            val_samples: 0,
            train_mae: 0.0,
            val_mae: None,
            baseline_val_mae: None,
            l2: 0.0,
            iterations: 0,
        },
    }
}

#[test]
fn compose_clips_minutes_and_rates() {
    let schema = FeatureSchema::new(&[3], &[Stat::Pts, Stat::Reb]);
    let mut rates = BTreeMap::new();
    rates.insert(Stat::Pts, constant_model(&schema, ModelTarget::Rate(Stat::Pts), 0.75, None));
    rates.insert(Stat::Reb, constant_model(&schema, ModelTarget::Rate(Stat::Reb), -0.2, None));
    let models = ModelSet {
        minutes: Some(constant_model(&schema, ModelTarget::Minutes, 61.0, None)),
        rates,
    };
    let rows = vec![DatasetRow {
        player_id: 5,
        row_key: "upcoming:2024-01-02".to_string(),
        target_date: date(2024, 1, 2),
        history_games: 4,
        features: vec![0.0; schema.columns().len()],
        label: None,
    }];
    let players = HashMap::from([(
        5,
        PlayerInfo {
            player_name: "Player 5".to_string(),
            team_abbrev: "AAA".to_string(),
        },
    )]);

    let out = compose(&schema, &models, &rows, &players).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].minutes, MAX_MINUTES);
    assert_eq!(out[0].value(Stat::Pts), Some(MAX_MINUTES * 0.75));
    assert_eq!(out[0].value(Stat::Reb), Some(0.0));
}
