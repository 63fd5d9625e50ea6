use crate::allocation::{AllocationCandidate, AllocationEngine, RebalanceOrder};
use crate::config::EngineSettings;
use crate::data_context::MarketDataSource;
use crate::error::EngineResult;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::price_utils::{build_timeline, fresh_price, rebalance_dates};
use crate::signals::{SignalEngine, SignalThresholds};
use chrono::NaiveDate;
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

const QUANTITY_EPSILON: f64 = 1e-9;
const SCREENING_TOP_N: usize = 10;

/// Anything that can turn parameters into a finished backtest.
pub trait BacktestRunner: Send + Sync {
    fn run(&self, params: &BacktestParams) -> EngineResult<BacktestResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationPhase {
    Initializing,
    AtRebalanceDate,
    Between,
    Completed,
    Failed,
}

impl SimulationPhase {
    pub fn can_advance_to(self, next: SimulationPhase) -> bool {
        use SimulationPhase::*;
        matches!(
            (self, next),
            (Initializing, AtRebalanceDate)
                | (Initializing, Between)
                | (Initializing, Failed)
                | (AtRebalanceDate, Between)
                | (Between, AtRebalanceDate)
                | (Between, Between)
                | (Between, Completed)
                | (AtRebalanceDate, Completed)
        )
    }
}

/// Ranking used to fill open slots: higher score, then cheaper PE (missing PE
/// last), then ticker.
pub fn compare_candidates(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.pe, b.pe) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.ticker.cmp(&b.ticker))
}

struct SimulationState {
    phase: SimulationPhase,
    cash: f64,
    positions: BTreeMap<String, Position>,
    trades: Vec<Trade>,
    errors: Vec<DataIssue>,
    equity_curve: Vec<EquityPoint>,
    screening: Vec<ScreeningSnapshot>,
}

impl SimulationState {
    fn new(initial_capital: f64) -> Self {
        Self {
            phase: SimulationPhase::Initializing,
            cash: initial_capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            errors: Vec::new(),
            equity_curve: Vec::new(),
            screening: Vec::new(),
        }
    }

    fn advance(&mut self, next: SimulationPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid simulation transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    fn record_issue(&mut self, date: NaiveDate, ticker: &str, kind: DataIssueKind, message: String) {
        self.errors.push(DataIssue {
            date: Some(date),
            ticker: ticker.to_string(),
            kind,
            message,
        });
    }
}

/// Replays the quality-value rule over historical data.
pub struct Engine {
    data: Arc<dyn MarketDataSource>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(data: Arc<dyn MarketDataSource>, settings: EngineSettings) -> Self {
        Self { data, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn backtest(&self, params: &BacktestParams) -> EngineResult<BacktestResult> {
        let mut state = SimulationState::new(params.initial_capital);
        if let Err(err) = params.validate() {
            state.advance(SimulationPhase::Failed);
            return Err(err);
        }

        let universe: Vec<String> = params
            .universe
            .iter()
            .map(|ticker| ticker.trim().to_string())
            .filter(|ticker| !ticker.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let schedule = rebalance_dates(params.start_date, params.end_date, params.rebalance_freq);
        let schedule_set: BTreeSet<NaiveDate> = schedule.iter().copied().collect();
        let timeline = build_timeline(
            params.start_date,
            params.end_date,
            &schedule,
            universe.iter().map(|ticker| self.data.price_series(ticker)),
        );
        info!(
            "Running backtest {} -> {} over {} tickers ({} rebalance dates, {} timeline points)",
            params.start_date,
            params.end_date,
            universe.len(),
            schedule.len(),
            timeline.len()
        );

        let thresholds = SignalThresholds::from(params);
        for date in &timeline {
            if schedule_set.contains(date) {
                state.advance(SimulationPhase::AtRebalanceDate);
                self.rebalance(&mut state, *date, &universe, &thresholds, params);
            }
            state.advance(SimulationPhase::Between);
            let point = self.mark_to_market(&state, *date);
            state.equity_curve.push(point);
        }

        let benchmark_curve = self.benchmark_curve(params, &mut state);
        let metrics = PerformanceCalculator::calculate(
            &state.equity_curve,
            &benchmark_curve,
            &state.trades,
            params.initial_capital,
        );
        let yearly_returns =
            PerformanceCalculator::yearly_returns(&state.equity_curve, params.initial_capital);
        state.advance(SimulationPhase::Completed);

        info!(
            "Backtest finished: total return {:.2}%, CAGR {:.2}%, max DD {:.2}%, {} trades, {} data issues",
            metrics.total_return,
            metrics.cagr,
            metrics.max_drawdown,
            state.trades.len(),
            state.errors.len()
        );

        Ok(BacktestResult {
            id: None,
            name: None,
            params: BacktestParams {
                universe,
                ..params.clone()
            },
            metrics,
            equity_curve: state.equity_curve,
            benchmark_curve,
            trades: state.trades,
            errors: state.errors,
            final_positions: state.positions.into_values().collect(),
            yearly_returns,
            screening_history: state.screening,
        })
    }

    fn rebalance(
        &self,
        state: &mut SimulationState,
        date: NaiveDate,
        universe: &[String],
        thresholds: &SignalThresholds,
        params: &BacktestParams,
    ) {
        let mut prices: HashMap<String, f64> = HashMap::new();
        let mut frozen: BTreeSet<String> = BTreeSet::new();
        let mut holds: Vec<String> = Vec::new();
        let mut exit_reasons: HashMap<String, String> = HashMap::new();
        let mut candidates: Vec<RankedCandidate> = Vec::new();
        let mut entry_reasons: HashMap<String, String> = HashMap::new();

        for ticker in universe {
            let held = state.positions.contains_key(ticker);
            let price = fresh_price(
                self.data.price_on(ticker, date),
                date,
                self.settings.price_staleness_days,
            );
            let Some(price) = price else {
                state.record_issue(
                    date,
                    ticker,
                    DataIssueKind::MissingPrice,
                    format!("No price for {} as of {}", ticker, date),
                );
                if held {
                    frozen.insert(ticker.clone());
                }
                continue;
            };
            prices.insert(ticker.clone(), price);

            let fundamentals = self.data.fundamentals_as_of(ticker, date);
            if fundamentals.is_none() {
                state.record_issue(
                    date,
                    ticker,
                    DataIssueKind::MissingFundamentals,
                    format!("No fundamentals for {} as of {}", ticker, date),
                );
                if !held {
                    continue;
                }
            }

            let decision = SignalEngine::classify(fundamentals, held, thresholds);
            if held {
                if decision.action == SignalAction::Sell {
                    exit_reasons.insert(ticker.clone(), decision.reason);
                } else {
                    if let (Some(warning), Some(_)) = (decision.data_warning, fundamentals) {
                        state.record_issue(date, ticker, DataIssueKind::IncompleteFundamentals, warning);
                    }
                    holds.push(ticker.clone());
                }
            } else if decision.action == SignalAction::Buy {
                if let Some(fundamentals) = fundamentals {
                    candidates.push(RankedCandidate {
                        ticker: ticker.clone(),
                        score: fundamentals.effective_score(),
                        pe: fundamentals.pe,
                        roe: fundamentals.roe,
                    });
                    entry_reasons.insert(ticker.clone(), decision.reason);
                }
            }
        }

        candidates.sort_by(compare_candidates);
        let open_slots = params
            .max_positions
            .saturating_sub(holds.len() + frozen.len());
        let target_set: Vec<AllocationCandidate> = holds
            .iter()
            .map(String::as_str)
            .chain(candidates.iter().take(open_slots).map(|c| c.ticker.as_str()))
            .map(AllocationCandidate::equal)
            .collect();

        let holdings: BTreeMap<String, f64> = state
            .positions
            .values()
            .filter(|position| !frozen.contains(&position.ticker))
            .map(|position| (position.ticker.clone(), position.quantity))
            .collect();
        let holdings_value: f64 = holdings
            .iter()
            .map(|(ticker, quantity)| quantity * prices.get(ticker).copied().unwrap_or(0.0))
            .sum();
        // Only cash still needs headroom for buy fees.
        let allocatable = holdings_value + state.cash / (1.0 + params.fee_rate);

        let targets =
            AllocationEngine::allocate(&target_set, WeightingMethod::Equal, allocatable, &prices);
        let orders = AllocationEngine::rebalance_orders(
            &targets,
            &holdings,
            &prices,
            self.settings.materiality_shares,
        );
        debug!(
            "{}: {} held, {} exits, {} candidates, {} orders",
            date,
            holds.len(),
            exit_reasons.len(),
            candidates.len(),
            orders.len()
        );

        for order in orders {
            let reason = match order.action {
                TradeAction::Sell => exit_reasons
                    .get(&order.ticker)
                    .cloned()
                    .unwrap_or_else(|| "Rebalance to equal weight".to_string()),
                TradeAction::Buy => entry_reasons
                    .get(&order.ticker)
                    .map(|reason| format!("Screen entry: {}", reason))
                    .unwrap_or_else(|| "Rebalance to equal weight".to_string()),
            };
            self.execute(state, date, order, reason, params.fee_rate);
        }

        state.screening.push(ScreeningSnapshot {
            date,
            eligible: candidates.len(),
            held: state.positions.len(),
            top_candidates: candidates.into_iter().take(SCREENING_TOP_N).collect(),
        });
    }

    fn execute(
        &self,
        state: &mut SimulationState,
        date: NaiveDate,
        order: RebalanceOrder,
        reason: String,
        fee_rate: f64,
    ) {
        let RebalanceOrder {
            ticker,
            action,
            shares,
            price,
        } = order;

        let shares = match action {
            TradeAction::Sell => {
                let held = state
                    .positions
                    .get(&ticker)
                    .map(|position| position.quantity)
                    .unwrap_or(0.0);
                shares.min(held)
            }
            TradeAction::Buy => {
                let unit_cost = price * (1.0 + fee_rate);
                if shares * unit_cost > state.cash {
                    state.cash / unit_cost
                } else {
                    shares
                }
            }
        };
        if shares <= QUANTITY_EPSILON {
            return;
        }

        let value = shares * price;
        let fees = value * fee_rate;
        match action {
            TradeAction::Sell => {
                state.cash += value - fees;
                let close = match state.positions.get_mut(&ticker) {
                    Some(position) => {
                        position.quantity -= shares;
                        position.quantity <= QUANTITY_EPSILON
                    }
                    None => false,
                };
                if close {
                    state.positions.remove(&ticker);
                }
            }
            TradeAction::Buy => {
                state.cash = (state.cash - value - fees).max(0.0);
                let position = state.positions.entry(ticker.clone()).or_insert(Position {
                    ticker: ticker.clone(),
                    quantity: 0.0,
                    average_cost: price,
                    entry_date: date,
                });
                let total_cost = position.cost_basis() + value;
                position.quantity += shares;
                position.average_cost = total_cost / position.quantity;
            }
        }

        state.trades.push(Trade {
            date,
            ticker,
            action,
            shares,
            price,
            fees,
            value,
            reason,
        });
    }

    fn mark_to_market(&self, state: &SimulationState, date: NaiveDate) -> EquityPoint {
        let invested: f64 = state
            .positions
            .values()
            .map(|position| {
                let price = self
                    .data
                    .price_on(&position.ticker, date)
                    .map(|point| point.close)
                    .unwrap_or(position.average_cost);
                position.quantity * price
            })
            .sum();
        EquityPoint {
            date,
            value: state.cash + invested,
            cash: state.cash,
            invested,
            positions: state.positions.len(),
        }
    }

    fn benchmark_curve(
        &self,
        params: &BacktestParams,
        state: &mut SimulationState,
    ) -> Vec<BenchmarkPoint> {
        let curve: Vec<BenchmarkPoint> = self
            .data
            .resolve_benchmark(&params.benchmark)
            .map(|ticker| {
                self.data
                    .price_series(&ticker)
                    .iter()
                    .filter(|point| point.date >= params.start_date && point.date <= params.end_date)
                    .map(|point| BenchmarkPoint {
                        date: point.date,
                        value: point.close,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if curve.is_empty() {
            state.errors.push(DataIssue {
                date: None,
                ticker: params.benchmark.clone(),
                kind: DataIssueKind::MissingBenchmark,
                message: format!(
                    "No benchmark series for {} between {} and {}",
                    params.benchmark, params.start_date, params.end_date
                ),
            });
        }
        curve
    }
}

impl BacktestRunner for Engine {
    fn run(&self, params: &BacktestParams) -> EngineResult<BacktestResult> {
        self.backtest(params)
    }
}
