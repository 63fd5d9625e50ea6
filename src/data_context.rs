use crate::models::{Fundamentals, PricePoint, Security};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Index tickers whose history is usually served through a tracking ETF.
const BENCHMARK_ALIASES: [(&str, &str); 6] = [
    ("^FCHI", "CAC.PA"),
    ("^STOXX50E", "MSE.PA"),
    ("^STOXX", "MEUD.PA"),
    ("^GDAXI", "DAX.PA"),
    ("^FTSE", "VUKE.LSE"),
    ("^AEX", "IAEX.AS"),
];

/// Read-only, time-indexed view of prices and fundamentals.
pub trait MarketDataSource: Send + Sync {
    fn security(&self, ticker: &str) -> Option<&Security>;

    /// Full series, ordered by date. Empty when the ticker is unknown.
    fn price_series(&self, ticker: &str) -> &[PricePoint];

    /// Latest close on or before `date`.
    fn price_on(&self, ticker: &str, date: NaiveDate) -> Option<PricePoint> {
        let series = self.price_series(ticker);
        let idx = series.partition_point(|point| point.date <= date);
        if idx == 0 {
            None
        } else {
            Some(series[idx - 1])
        }
    }

    /// Latest fundamentals version with `as_of <= date`.
    fn fundamentals_as_of(&self, ticker: &str, date: NaiveDate) -> Option<&Fundamentals> {
        let security = self.security(ticker)?;
        let idx = security
            .fundamentals
            .partition_point(|version| version.as_of <= date);
        if idx == 0 {
            None
        } else {
            Some(&security.fundamentals[idx - 1].fundamentals)
        }
    }

    /// The ticker whose series should stand in for `benchmark`, if any.
    fn resolve_benchmark(&self, benchmark: &str) -> Option<String> {
        let benchmark = benchmark.trim();
        if benchmark.is_empty() {
            return None;
        }
        if !self.price_series(benchmark).is_empty() {
            return Some(benchmark.to_string());
        }
        BENCHMARK_ALIASES
            .iter()
            .find(|(index, _)| index.eq_ignore_ascii_case(benchmark))
            .map(|(_, proxy)| proxy.to_string())
            .filter(|proxy| !self.price_series(proxy).is_empty())
    }
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    securities: Vec<Security>,
    prices: HashMap<String, Vec<PricePoint>>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

/// Immutable market-data snapshot. Cloning is cheap and every clone sees the
/// same data for its whole lifetime.
#[derive(Clone)]
pub struct MarketData {
    securities: Arc<HashMap<String, Security>>,
    prices: Arc<HashMap<String, Vec<PricePoint>>>,
    settings: Arc<HashMap<String, String>>,
    generated_at: DateTime<Utc>,
}

impl MarketData {
    pub fn from_components(
        securities: Vec<Security>,
        prices: HashMap<String, Vec<PricePoint>>,
        settings: HashMap<String, String>,
    ) -> Result<Self> {
        let mut by_ticker = HashMap::with_capacity(securities.len());
        for mut security in securities {
            let ticker = security.ticker.trim().to_string();
            if ticker.is_empty() {
                return Err(anyhow!("Security with an empty ticker in market data"));
            }
            security
                .fundamentals
                .sort_by(|a, b| a.as_of.cmp(&b.as_of));
            if let Some(pair) = security
                .fundamentals
                .windows(2)
                .find(|pair| pair[0].as_of == pair[1].as_of)
            {
                return Err(anyhow!(
                    "Duplicate fundamentals for {} as of {}",
                    ticker,
                    pair[0].as_of
                ));
            }
            security.ticker = ticker.clone();
            if by_ticker.insert(ticker.clone(), security).is_some() {
                return Err(anyhow!("Duplicate security {} in market data", ticker));
            }
        }

        for (ticker, series) in &prices {
            validate_series(ticker, series)?;
        }

        Ok(Self {
            securities: Arc::new(by_ticker),
            prices: Arc::new(prices),
            settings: Arc::new(settings),
            generated_at: Utc::now(),
        })
    }

    /// Loads a snapshot file. `.json` files are read as JSON, anything else as
    /// the binary snapshot format.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot = if is_json_path(path) {
            serde_json::from_reader(reader).context("Snapshot JSON decode failed")?
        } else {
            bincode::deserialize_from(reader).context("Snapshot decode failed")?
        };

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let mut data =
            Self::from_components(snapshot.securities, snapshot.prices, snapshot.settings)?;
        data.generated_at = snapshot.generated_at;
        info!(
            "Loaded {} securities and {} price series",
            data.securities.len(),
            data.prices.len()
        );
        Ok(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let mut securities: Vec<Security> = self.securities.values().cloned().collect();
        securities.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: self.generated_at,
            securities,
            prices: self.prices.as_ref().clone(),
            settings: self.settings.as_ref().clone(),
        };
        if is_json_path(path) {
            serde_json::to_writer(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?;
        } else {
            bincode::serialize_into(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?;
        }
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        self.settings.as_ref()
    }

    pub fn tickers(&self) -> Vec<String> {
        let tickers: BTreeSet<&String> = self.securities.keys().collect();
        tickers.into_iter().cloned().collect()
    }

    /// Explicit tickers win; otherwise the scope picks by country, with
    /// `europe`/`all` selecting every security.
    pub fn resolve_universe(&self, scope: &str, explicit: &[String]) -> Vec<String> {
        let explicit: BTreeSet<String> = explicit
            .iter()
            .map(|ticker| ticker.trim().to_string())
            .filter(|ticker| !ticker.is_empty())
            .collect();
        if !explicit.is_empty() {
            return explicit.into_iter().collect();
        }

        let scope = scope.trim().to_ascii_lowercase();
        let selected: BTreeSet<String> = self
            .securities
            .values()
            .filter(|security| match scope.as_str() {
                "" | "all" | "europe" => true,
                country => security.country.eq_ignore_ascii_case(country),
            })
            .map(|security| security.ticker.clone())
            .collect();
        selected.into_iter().collect()
    }
}

impl MarketDataSource for MarketData {
    fn security(&self, ticker: &str) -> Option<&Security> {
        self.securities.get(ticker)
    }

    fn price_series(&self, ticker: &str) -> &[PricePoint] {
        self.prices
            .get(ticker)
            .map(|series| series.as_slice())
            .unwrap_or(&[])
    }
}

fn validate_series(ticker: &str, series: &[PricePoint]) -> Result<()> {
    for point in series {
        if !point.close.is_finite() || point.close <= 0.0 {
            return Err(anyhow!(
                "Invalid close {} for {} on {}",
                point.close,
                ticker,
                point.date
            ));
        }
    }
    if let Some(pair) = series.windows(2).find(|pair| pair[0].date >= pair[1].date) {
        return Err(anyhow!(
            "Price series for {} is not strictly increasing ({} then {})",
            ticker,
            pair[0].date,
            pair[1].date
        ));
    }
    Ok(())
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Holder of the current snapshot. Runs take an `Arc` at start; a refresh
/// publishes a new snapshot without touching the ones already handed out.
pub struct MarketDataStore {
    current: RwLock<Arc<MarketData>>,
}

impl MarketDataStore {
    pub fn new(data: MarketData) -> Self {
        Self {
            current: RwLock::new(Arc::new(data)),
        }
    }

    pub fn snapshot(&self) -> Arc<MarketData> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    pub fn replace(&self, data: MarketData) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(data);
    }
}
