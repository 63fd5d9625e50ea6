//! Request and response shapes for the backtest, optimize and rebalance
//! entry points. Every request field is optional and falls back to the
//! engine defaults.

use crate::data_context::MarketData;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    BacktestMetrics, BacktestParams, BacktestResult, BenchmarkPoint, DataIssue, EquityPoint,
    PortfolioSnapshot, RebalanceFrequency, Trade, WeightingMethod, YearlyReturn, DEFAULT_SCOPE,
};
use crate::optimizer::{OptimizationGoal, OptimizeRequest};
use crate::param_utils::ParameterGrid;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// Optimizations look further back than single backtests by default.
pub const OPTIMIZE_DEFAULT_START: (i32, u32, u32) = (2014, 1, 1);

/// Tickers given either as `"A.PA, B.PA"` or as a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UniverseInput {
    Csv(String),
    List(Vec<String>),
}

impl UniverseInput {
    pub fn tickers(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            UniverseInput::Csv(list) => list.split(',').collect(),
            UniverseInput::List(items) => items.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|ticker| !ticker.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BacktestRequest {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub universe_scope: Option<String>,
    pub universe: Option<UniverseInput>,
    pub pe_max: Option<f64>,
    pub roe_min: Option<f64>,
    pub pe_sell: Option<f64>,
    pub roe_min_hold: Option<f64>,
    pub debt_equity_max: Option<f64>,
    pub rebalance_freq: Option<String>,
    pub initial_capital: Option<f64>,
    pub max_positions: Option<usize>,
    pub benchmark: Option<String>,
    pub fee_rate: Option<f64>,
}

impl BacktestRequest {
    /// Fills in defaults and resolves the universe against `data`.
    pub fn into_params(self, data: &MarketData) -> EngineResult<BacktestParams> {
        let defaults = BacktestParams::default();
        let scope = scope_or_default(self.universe_scope);
        let explicit = self.universe.map(|u| u.tickers()).unwrap_or_default();
        let universe = data.resolve_universe(&scope, &explicit);
        let rebalance_freq = match self.rebalance_freq.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw.parse::<RebalanceFrequency>()?,
            _ => defaults.rebalance_freq,
        };

        let params = BacktestParams {
            start_date: self.start_date.unwrap_or(defaults.start_date),
            end_date: self.end_date.unwrap_or(defaults.end_date),
            rebalance_freq,
            pe_max: self.pe_max.unwrap_or(defaults.pe_max),
            roe_min: self.roe_min.unwrap_or(defaults.roe_min),
            pe_sell: self.pe_sell.unwrap_or(defaults.pe_sell),
            roe_min_hold: self.roe_min_hold.unwrap_or(defaults.roe_min_hold),
            debt_equity_max: self.debt_equity_max.unwrap_or(defaults.debt_equity_max),
            max_positions: self.max_positions.unwrap_or(defaults.max_positions),
            initial_capital: self.initial_capital.unwrap_or(defaults.initial_capital),
            universe,
            benchmark: self
                .benchmark
                .filter(|b| !b.trim().is_empty())
                .unwrap_or(defaults.benchmark),
            fee_rate: self.fee_rate.unwrap_or(defaults.fee_rate),
            scope,
        };
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptimizeRequestBody {
    pub scope: Option<String>,
    pub goal: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub universe: Option<UniverseInput>,
    pub grid: Option<ParameterGrid>,
}

impl OptimizeRequestBody {
    pub fn into_request(self, data: &MarketData) -> EngineResult<OptimizeRequest> {
        let goal = match self.goal.as_deref() {
            Some(raw) => raw.parse::<OptimizationGoal>()?,
            None => OptimizationGoal::default(),
        };
        let (y, m, d) = OPTIMIZE_DEFAULT_START;
        let start_date = self
            .start_date
            .or_else(|| NaiveDate::from_ymd_opt(y, m, d))
            .ok_or_else(|| EngineError::validation("invalid default start date"))?;
        let base = BacktestRequest {
            start_date: Some(start_date),
            end_date: Some(self.end_date.unwrap_or_else(|| Local::now().date_naive())),
            universe_scope: self.scope,
            universe: self.universe,
            ..BacktestRequest::default()
        }
        .into_params(data)?;

        Ok(OptimizeRequest {
            base,
            grid: self.grid.unwrap_or_default(),
            goal,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebalanceRequest {
    #[serde(default)]
    pub method: Option<String>,
    pub portfolio: PortfolioSnapshot,
}

impl RebalanceRequest {
    pub fn method(&self) -> EngineResult<WeightingMethod> {
        match self.method.as_deref() {
            Some(raw) => raw.parse(),
            None => Ok(WeightingMethod::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResponse {
    pub metrics: BacktestMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub benchmark_curve: Vec<BenchmarkPoint>,
    pub trades: Vec<Trade>,
    pub errors: Vec<DataIssue>,
    pub yearly_returns: Vec<YearlyReturn>,
    pub saved_id: Option<String>,
}

impl BacktestResponse {
    pub fn from_result(result: BacktestResult, saved_id: Option<String>) -> Self {
        Self {
            metrics: result.metrics,
            equity_curve: result.equity_curve,
            benchmark_curve: result.benchmark_curve,
            trades: result.trades,
            errors: result.errors,
            yearly_returns: result.yearly_returns,
            saved_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new<E: std::fmt::Display>(err: E) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

fn scope_or_default(scope: Option<String>) -> String {
    scope
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Security;
    use std::collections::HashMap;

    fn data() -> MarketData {
        let security = |ticker: &str, country: &str| Security {
            ticker: ticker.to_string(),
            name: ticker.to_string(),
            sector: String::new(),
            country: country.to_string(),
            fundamentals: Vec::new(),
        };
        MarketData::from_components(
            vec![
                security("AAA.PA", "France"),
                security("BBB.PA", "France"),
                security("CCC.DE", "Germany"),
            ],
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn universe_accepts_string_or_list() {
        let csv: BacktestRequest =
            serde_json::from_str(r#"{"universe": " AAA.PA, ,CCC.DE "}"#).unwrap();
        let list: BacktestRequest =
            serde_json::from_str(r#"{"universe": ["AAA.PA", "CCC.DE"]}"#).unwrap();
        assert_eq!(csv.universe.unwrap().tickers(), vec!["AAA.PA", "CCC.DE"]);
        assert_eq!(list.universe.unwrap().tickers(), vec!["AAA.PA", "CCC.DE"]);
    }

    #[test]
    fn empty_request_uses_defaults_and_scope() {
        let params = BacktestRequest {
            end_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            ..BacktestRequest::default()
        }
        .into_params(&data())
        .unwrap();
        assert_eq!(params.universe, vec!["AAA.PA", "BBB.PA"]);
        assert_eq!(params.pe_max, 12.0);
        assert_eq!(params.rebalance_freq, RebalanceFrequency::Quarterly);
        assert_eq!(params.benchmark, "^FCHI");

        let all = BacktestRequest {
            end_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            universe_scope: Some("Europe".to_string()),
            ..BacktestRequest::default()
        }
        .into_params(&data())
        .unwrap();
        assert_eq!(all.universe.len(), 3);
    }

    #[test]
    fn inverted_dates_are_rejected() {
        let err = BacktestRequest {
            start_date: NaiveDate::from_ymd_opt(2021, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            ..BacktestRequest::default()
        }
        .into_params(&data())
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn unknown_scope_leaves_an_empty_universe() {
        let err = BacktestRequest {
            end_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            universe_scope: Some("japan".to_string()),
            ..BacktestRequest::default()
        }
        .into_params(&data())
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn optimize_body_parses_goal_alias() {
        let body: OptimizeRequestBody =
            serde_json::from_str(r#"{"scope": "france", "goal": "max_return", "end_date": "2020-06-30"}"#)
                .unwrap();
        let request = body.into_request(&data()).unwrap();
        assert_eq!(request.goal, OptimizationGoal::Growth);
        assert_eq!(request.base.start_date, NaiveDate::from_ymd_opt(2014, 1, 1).unwrap());
        assert_eq!(request.grid, ParameterGrid::default());
    }

    #[test]
    fn rebalance_method_defaults_to_equal() {
        let request: RebalanceRequest =
            serde_json::from_str(r#"{"portfolio": {"positions": [], "cash": 10.0}}"#).unwrap();
        assert_eq!(request.method().unwrap(), WeightingMethod::Equal);
    }
}
