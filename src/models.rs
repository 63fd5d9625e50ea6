use crate::error::{EngineError, EngineResult};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BENCHMARK: &str = "^FCHI";
pub const DEFAULT_SCOPE: &str = "france";

/// Point-in-time fundamentals. ROE, debt/equity and net margin are percentages
/// (ROE 12 means 12 %, debt/equity 100 means 1.0x).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    #[serde(default)]
    pub pe: Option<f64>,
    #[serde(default)]
    pub roe: Option<f64>,
    #[serde(default)]
    pub debt_equity: Option<f64>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub net_margin: Option<f64>,
}

impl Fundamentals {
    pub fn new(pe: f64, roe: f64, debt_equity: f64, score: f64) -> Self {
        Self {
            pe: Some(pe),
            roe: Some(roe),
            debt_equity: Some(debt_equity),
            score: Some(score),
            net_margin: None,
        }
    }

    /// Supplied score, or the derived quality score when the provider has none.
    pub fn effective_score(&self) -> f64 {
        match self.score {
            Some(score) if score.is_finite() => score.max(0.0),
            _ => crate::signals::quality_score(self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsVersion {
    pub as_of: NaiveDate,
    pub fundamentals: Fundamentals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub ticker: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sector: String,
    #[serde(default)]
    pub country: String,
    /// Versions ordered by `as_of`.
    #[serde(default)]
    pub fundamentals: Vec<FundamentalsVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub quantity: f64,
    pub average_cost: f64,
    pub entry_date: NaiveDate,
}

impl Position {
    pub fn cost_basis(&self) -> f64 {
        self.quantity * self.average_cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub date: NaiveDate,
    pub ticker: String,
    pub action: TradeAction,
    pub shares: f64,
    pub price: f64,
    pub fees: f64,
    pub value: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceFrequency {
    Monthly,
    Quarterly,
    #[serde(alias = "semi_annual", alias = "semiannual")]
    SemiAnnual,
    #[serde(alias = "annual")]
    Yearly,
}

impl RebalanceFrequency {
    pub fn months(self) -> u32 {
        match self {
            RebalanceFrequency::Monthly => 1,
            RebalanceFrequency::Quarterly => 3,
            RebalanceFrequency::SemiAnnual => 6,
            RebalanceFrequency::Yearly => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RebalanceFrequency::Monthly => "monthly",
            RebalanceFrequency::Quarterly => "quarterly",
            RebalanceFrequency::SemiAnnual => "semi-annual",
            RebalanceFrequency::Yearly => "yearly",
        }
    }
}

impl FromStr for RebalanceFrequency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(RebalanceFrequency::Monthly),
            "quarterly" => Ok(RebalanceFrequency::Quarterly),
            "semi-annual" | "semi_annual" | "semiannual" => Ok(RebalanceFrequency::SemiAnnual),
            "yearly" | "annual" => Ok(RebalanceFrequency::Yearly),
            other => Err(EngineError::validation(format!(
                "rebalance_freq must be monthly, quarterly, semi-annual or yearly (value: {})",
                other
            ))),
        }
    }
}

impl fmt::Display for RebalanceFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable configuration of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rebalance_freq: RebalanceFrequency,
    pub pe_max: f64,
    pub roe_min: f64,
    pub pe_sell: f64,
    pub roe_min_hold: f64,
    pub debt_equity_max: f64,
    pub max_positions: usize,
    pub initial_capital: f64,
    pub universe: Vec<String>,
    pub benchmark: String,
    #[serde(default)]
    pub fee_rate: f64,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default(),
            end_date: Local::now().date_naive(),
            rebalance_freq: RebalanceFrequency::Quarterly,
            pe_max: 12.0,
            roe_min: 10.0,
            pe_sell: 17.0,
            roe_min_hold: 8.0,
            debt_equity_max: 100.0,
            max_positions: 20,
            initial_capital: 100_000.0,
            universe: Vec::new(),
            benchmark: DEFAULT_BENCHMARK.to_string(),
            fee_rate: 0.0,
            scope: default_scope(),
        }
    }
}

impl BacktestParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.start_date >= self.end_date {
            return Err(EngineError::validation(format!(
                "start_date ({}) must be before end_date ({})",
                self.start_date, self.end_date
            )));
        }
        if self.universe.iter().all(|ticker| ticker.trim().is_empty()) {
            return Err(EngineError::validation("universe must contain at least one ticker"));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(EngineError::validation(format!(
                "initial_capital must be positive (value: {})",
                self.initial_capital
            )));
        }
        if self.max_positions == 0 {
            return Err(EngineError::validation("max_positions must be positive"));
        }
        if !self.fee_rate.is_finite() || self.fee_rate < 0.0 {
            return Err(EngineError::validation(format!(
                "fee_rate must be >= 0 (value: {})",
                self.fee_rate
            )));
        }
        let thresholds = [
            ("pe_max", self.pe_max),
            ("roe_min", self.roe_min),
            ("pe_sell", self.pe_sell),
            ("roe_min_hold", self.roe_min_hold),
            ("debt_equity_max", self.debt_equity_max),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() {
                return Err(EngineError::validation(format!(
                    "{} must be a finite number (value: {})",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Default history label, e.g. `FRANCE PE<=12 ROE>=10%`.
    pub fn display_name(&self) -> String {
        format!(
            "{} PE<={} ROE>={}%",
            self.scope.to_uppercase(),
            self.pe_max,
            self.roe_min
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub cash: f64,
    pub invested: f64,
    pub positions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataIssueKind {
    MissingPrice,
    MissingFundamentals,
    IncompleteFundamentals,
    MissingBenchmark,
}

/// Non-fatal per-ticker/date failure collected during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIssue {
    pub date: Option<NaiveDate>,
    pub ticker: String,
    pub kind: DataIssueKind,
    pub message: String,
}

/// Percentages are 0-100; ratios (Sharpe, Sortino, beta) are plain numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub initial_capital: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_trades: usize,
    pub benchmark_return: f64,
    pub alpha: f64,
    pub beta: f64,
    pub tracking_error: f64,
    pub annualization_factor: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlyReturn {
    pub year: i32,
    pub start_value: f64,
    pub end_value: f64,
    pub return_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub ticker: String,
    pub score: f64,
    pub pe: Option<f64>,
    pub roe: Option<f64>,
}

/// What the screen looked like on one rebalance date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningSnapshot {
    pub date: NaiveDate,
    pub eligible: usize,
    pub held: usize,
    pub top_candidates: Vec<RankedCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub params: BacktestParams,
    pub metrics: BacktestMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub benchmark_curve: Vec<BenchmarkPoint>,
    pub trades: Vec<Trade>,
    pub errors: Vec<DataIssue>,
    pub final_positions: Vec<Position>,
    pub yearly_returns: Vec<YearlyReturn>,
    pub screening_history: Vec<ScreeningSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    #[default]
    Equal,
    Score,
    Conviction,
}

impl WeightingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            WeightingMethod::Equal => "equal",
            WeightingMethod::Score => "score",
            WeightingMethod::Conviction => "conviction",
        }
    }
}

impl FromStr for WeightingMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "equal" => Ok(WeightingMethod::Equal),
            "score" => Ok(WeightingMethod::Score),
            "conviction" => Ok(WeightingMethod::Conviction),
            other => Err(EngineError::validation(format!(
                "method must be equal, score or conviction (value: {})",
                other
            ))),
        }
    }
}

/// One line of the live portfolio as supplied by the portfolio store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub ticker: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sector: String,
    pub quantity: f64,
    #[serde(default)]
    pub average_cost: f64,
    pub current_price: f64,
    #[serde(default)]
    pub fundamentals: Option<Fundamentals>,
    #[serde(default)]
    pub conviction: Option<f64>,
    /// Latest analyst verdict, e.g. `buy`, `hold` or `sell`.
    #[serde(default)]
    pub verdict: Option<String>,
}

impl HoldingSnapshot {
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<HoldingSnapshot>,
    #[serde(default)]
    pub cash: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImbalanceType {
    Overweight,
    Underweight,
    SectorOverexposure,
    PeHigh,
    ScoreDeterioration,
    VerdictChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RebalanceAction {
    #[serde(alias = "ADD")]
    Increase,
    Reduce,
    Sell,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Imbalance {
    pub ticker: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ImbalanceType,
    pub severity: Severity,
    pub current_value: f64,
    pub threshold: f64,
    pub message: String,
    pub suggested_action: RebalanceAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceProposal {
    pub ticker: String,
    pub name: String,
    pub action: RebalanceAction,
    pub current_weight: f64,
    pub target_weight: f64,
    pub deviation: f64,
    pub current_value: f64,
    pub trade_value: f64,
    pub shares_to_trade: f64,
    pub current_price: f64,
    pub reason: String,
}
