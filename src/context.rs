use crate::config::EngineSettings;
use crate::data_context::{MarketData, MarketDataSource, MarketDataStore};
use crate::engine::Engine;
use crate::history::HistoryStore;
use crate::job_status::JobSlot;
use anyhow::{Context, Result};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

pub const REFRESH_JOB: &str = "Market data refresh";
pub const OPTIMIZE_JOB: &str = "Optimization";

/// Shared state of one engine process: the current market-data snapshot, the
/// history file and the single-flight slots for long jobs.
pub struct AppContext {
    market_data_file: PathBuf,
    history_file: PathBuf,
    store: OnceLock<MarketDataStore>,
    refresh_job: JobSlot,
    optimizer_job: JobSlot,
}

impl AppContext {
    pub fn new<P: Into<PathBuf>, H: Into<PathBuf>>(market_data_file: P, history_file: H) -> Self {
        Self {
            market_data_file: market_data_file.into(),
            history_file: history_file.into(),
            store: OnceLock::new(),
            refresh_job: JobSlot::new(),
            optimizer_job: JobSlot::new(),
        }
    }

    /// Context over an already loaded snapshot.
    pub fn with_market_data<P: Into<PathBuf>, H: Into<PathBuf>>(
        market_data_file: P,
        history_file: H,
        data: MarketData,
    ) -> Self {
        let context = Self::new(market_data_file, history_file);
        let _ = context.store.set(MarketDataStore::new(data));
        context
    }

    /// Current snapshot, loading the market data file on first use.
    pub fn market_data(&self) -> Result<Arc<MarketData>> {
        if let Some(store) = self.store.get() {
            return Ok(store.snapshot());
        }
        let data = MarketData::load_from_file(&self.market_data_file)?;
        Ok(self.store.get_or_init(|| MarketDataStore::new(data)).snapshot())
    }

    /// Settings carried by the snapshot. Defaults apply when no snapshot is
    /// available, e.g. for a rebalance of a portfolio file alone.
    pub fn settings(&self) -> Result<EngineSettings> {
        if self.store.get().is_none() && !self.market_data_file.exists() {
            warn!(
                "No market data at {}; using default settings",
                self.market_data_file.display()
            );
            return Ok(EngineSettings::default());
        }
        let data = self.market_data()?;
        EngineSettings::from_settings_map(data.settings())
            .context("Invalid settings in market data snapshot")
    }

    /// An engine pinned to the snapshot current at call time.
    pub fn engine(&self) -> Result<Engine> {
        self.engine_with_data().map(|(_, engine)| engine)
    }

    /// The current snapshot together with an engine over that same snapshot.
    pub fn engine_with_data(&self) -> Result<(Arc<MarketData>, Engine)> {
        let data = self.market_data()?;
        let settings = EngineSettings::from_settings_map(data.settings())
            .context("Invalid settings in market data snapshot")?;
        let engine = Engine::new(Arc::clone(&data) as Arc<dyn MarketDataSource>, settings);
        Ok((data, engine))
    }

    pub fn history(&self) -> HistoryStore {
        let max_entries = self
            .store
            .get()
            .and_then(|store| EngineSettings::from_settings_map(store.snapshot().settings()).ok())
            .map(|settings| settings.history_max_entries)
            .unwrap_or_else(|| EngineSettings::default().history_max_entries);
        HistoryStore::new(&self.history_file, max_entries)
    }

    pub fn refresh_job(&self) -> &JobSlot {
        &self.refresh_job
    }

    pub fn optimizer_job(&self) -> &JobSlot {
        &self.optimizer_job
    }

    /// Re-reads the market data file and publishes it as the new snapshot.
    /// Runs already holding the previous snapshot keep it.
    pub fn refresh_market_data(&self) -> Result<()> {
        let job = self.refresh_job.try_start(REFRESH_JOB, 1)?;
        job.set_message(format!("Loading {}", self.market_data_file.display()));

        let data = MarketData::load_from_file(&self.market_data_file)?;
        let tickers = data.tickers().len();
        match self.store.get() {
            Some(store) => store.replace(data),
            None => {
                let _ = self.store.set(MarketDataStore::new(data));
            }
        }

        job.set_progress::<String>(1, None);
        job.finish(format!("Refreshed {} securities", tickers));
        info!(
            "Market data refreshed from {} ({} securities)",
            self.market_data_file.display(),
            tickers
        );
        Ok(())
    }
}
