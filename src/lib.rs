pub mod config;
pub mod dataset;
pub mod error;
pub mod export;
pub mod features;
pub mod game_log;
pub mod http_client;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod projection;
pub mod provider;
pub mod retry;
pub mod store;
pub mod training;
