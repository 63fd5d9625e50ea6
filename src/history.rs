use crate::error::EngineError;
use crate::models::{BacktestMetrics, BacktestParams, BacktestResult, YearlyReturn};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// Summary of a saved backtest. Trades and curves are not kept, only counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub date: DateTime<Utc>,
    pub params: BacktestParams,
    pub metrics: BacktestMetrics,
    #[serde(default)]
    pub yearly_returns: Vec<YearlyReturn>,
    pub trades_count: usize,
    pub errors_count: usize,
    pub equity_points: usize,
}

/// Backtest history kept as a JSON array, newest first.
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
}

impl HistoryStore {
    pub fn new<P: Into<PathBuf>>(path: P, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn list(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read history file {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse history file {}", self.path.display()))
    }

    pub fn get(&self, id: &str) -> Result<HistoryEntry> {
        self.list()?
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| EngineError::UnknownBacktest(id.to_string()).into())
    }

    /// Stores a summary of `result` and returns its new id. Without a name the
    /// entry is labelled from its scope and entry thresholds.
    pub fn save(&self, result: &BacktestResult, name: Option<&str>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| result.params.display_name());

        let entry = HistoryEntry {
            id: id.clone(),
            name,
            date: Utc::now(),
            params: result.params.clone(),
            metrics: result.metrics.clone(),
            yearly_returns: result.yearly_returns.clone(),
            trades_count: result.trades.len(),
            errors_count: result.errors.len(),
            equity_points: result.equity_curve.len(),
        };

        let mut entries = self.list()?;
        entries.insert(0, entry);
        entries.truncate(self.max_entries);
        self.write(&entries)?;
        info!("Saved backtest {} to history ({} entries)", id, entries.len());
        Ok(id)
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("name must not be empty").into());
        }
        let mut entries = self.list()?;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| EngineError::UnknownBacktest(id.to_string()))?;
        entry.name = name.to_string();
        self.write(&entries)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut entries = self.list()?;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return Err(EngineError::UnknownBacktest(id.to_string()).into());
        }
        self.write(&entries)
    }

    fn write(&self, entries: &[HistoryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create history directory {}", parent.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(entries).context("Failed to serialize history")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write history file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace history file {}", self.path.display()))
    }
}
