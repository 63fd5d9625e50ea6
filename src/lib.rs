pub mod allocation;
pub mod api;
pub mod cache;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod history;
pub mod job_status;
pub mod models;
pub mod optimizer;
pub mod param_utils;
pub mod performance;
pub mod price_utils;
pub mod rebalancing;
pub mod signals;

pub use error::{EngineError, EngineResult};
