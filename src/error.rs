use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient fetch failure for {unit} after {attempts} attempts: {message}")]
    TransientFetch {
        unit: String,
        attempts: u32,
        message: String,
    },

    #[error("fetch failed for {unit}: {message}")]
    Fetch { unit: String, message: String },

    #[error("duplicate key player={player_id} game={game_id} resolved by upsert")]
    DuplicateKey { player_id: i64, game_id: String },

    #[error("player {player_id} has {prior_games} prior games before {as_of}")]
    InsufficientHistory {
        player_id: i64,
        as_of: NaiveDate,
        prior_games: usize,
    },

    #[error("model {model} feature schema mismatch: missing={missing:?} extra={extra:?} reordered={reordered}")]
    SchemaMismatch {
        model: String,
        missing: Vec<String>,
        extra: Vec<String>,
        reordered: bool,
    },

    #[error("cannot train {model}: {reason}")]
    TrainingData { model: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn training(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TrainingData {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}
