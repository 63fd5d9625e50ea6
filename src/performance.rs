use crate::models::*;
use chrono::{Datelike, NaiveDate};
use statrs::statistics::Statistics;
use std::collections::{HashMap, VecDeque};

const DAYS_PER_YEAR: f64 = 365.25;

/// One realized exit, paired FIFO against earlier buys of the same ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub ticker: String,
    pub date: NaiveDate,
    pub pnl: f64,
    pub pnl_percent: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Derives every run metric. Degenerate inputs produce zeros and a warning
    /// instead of an error.
    pub fn calculate(
        equity_curve: &[EquityPoint],
        benchmark_curve: &[BenchmarkPoint],
        trades: &[Trade],
        initial_capital: f64,
    ) -> BacktestMetrics {
        let mut warnings = Vec::new();
        let values: Vec<f64> = equity_curve.iter().map(|p| p.value).collect();
        let dates: Vec<NaiveDate> = equity_curve.iter().map(|p| p.date).collect();

        let final_value = values.last().copied().unwrap_or(initial_capital);
        let total_return = Self::total_return(initial_capital, final_value);

        let elapsed_days = match (dates.first(), dates.last()) {
            (Some(first), Some(last)) => (*last - *first).num_days(),
            _ => 0,
        };
        let cagr = Self::calculate_cagr(initial_capital, final_value, elapsed_days);
        if elapsed_days < 1 {
            warnings.push("Backtest spans less than one day; CAGR reported as 0".to_string());
        }

        let annualization_factor = Self::annualization_factor(&dates);
        let returns = Self::period_returns(&values);
        let (volatility, sharpe_ratio, sortino_ratio) = if returns.len() < 2 {
            warnings.push(
                "Fewer than three equity points; volatility, Sharpe and Sortino reported as 0"
                    .to_string(),
            );
            (0.0, 0.0, 0.0)
        } else {
            Self::risk_ratios(&returns, annualization_factor, &mut warnings)
        };

        let max_drawdown = Self::calculate_max_drawdown(&values);

        let closed = Self::closed_trades(trades);
        let winners: Vec<f64> = closed
            .iter()
            .map(|c| c.pnl_percent)
            .filter(|pct| *pct > 0.0)
            .collect();
        let losers: Vec<f64> = closed
            .iter()
            .map(|c| c.pnl_percent)
            .filter(|pct| *pct <= 0.0)
            .collect();
        let win_rate = if closed.is_empty() {
            0.0
        } else {
            winners.len() as f64 / closed.len() as f64 * 100.0
        };

        let mut metrics = BacktestMetrics {
            initial_capital,
            final_value,
            total_return,
            cagr,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            win_rate,
            closed_trades: closed.len(),
            winning_trades: winners.len(),
            avg_win: Self::average(&winners),
            avg_loss: Self::average(&losers),
            total_trades: trades.len(),
            annualization_factor,
            ..BacktestMetrics::default()
        };

        Self::apply_benchmark(
            &mut metrics,
            equity_curve,
            benchmark_curve,
            &mut warnings,
        );
        metrics.warnings = warnings;
        metrics
    }

    pub fn total_return(initial_capital: f64, final_value: f64) -> f64 {
        if initial_capital <= 0.0 || !final_value.is_finite() {
            return 0.0;
        }
        (final_value / initial_capital - 1.0) * 100.0
    }

    /// Compound annual growth in percent. Zero below one elapsed day.
    pub fn calculate_cagr(initial_capital: f64, final_value: f64, elapsed_days: i64) -> f64 {
        if initial_capital <= 0.0 || !final_value.is_finite() || elapsed_days < 1 {
            return 0.0;
        }
        let years = elapsed_days as f64 / DAYS_PER_YEAR;
        let ratio = final_value / initial_capital;
        if ratio <= 0.0 {
            return -100.0;
        }
        (ratio.powf(1.0 / years) - 1.0) * 100.0
    }

    pub fn period_returns(values: &[f64]) -> Vec<f64> {
        values
            .windows(2)
            .map(|window| {
                let prev_value = window[0];
                let curr_value = window[1];
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Periods per year implied by the mean spacing of the curve.
    pub fn annualization_factor(dates: &[NaiveDate]) -> f64 {
        if dates.len() < 2 {
            return 0.0;
        }
        let span = (dates[dates.len() - 1] - dates[0]).num_days() as f64;
        if span <= 0.0 {
            return 0.0;
        }
        let mean_interval = span / (dates.len() - 1) as f64;
        DAYS_PER_YEAR / mean_interval
    }

    fn risk_ratios(
        returns: &[f64],
        annualization_factor: f64,
        warnings: &mut Vec<String>,
    ) -> (f64, f64, f64) {
        let scale = annualization_factor.sqrt();
        let mean_return = returns.mean();
        let std_dev = finite_or_zero(returns.std_dev());
        let volatility = std_dev * scale * 100.0;

        let sharpe = if std_dev > 0.0 {
            mean_return / std_dev * scale
        } else {
            warnings.push("Zero return volatility; Sharpe ratio reported as 0".to_string());
            0.0
        };

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_dev = if downside.len() >= 2 {
            finite_or_zero(downside.std_dev())
        } else {
            0.0
        };
        let sortino = if downside_dev > 0.0 {
            mean_return / downside_dev * scale
        } else {
            warnings.push(
                "Not enough negative periods for downside deviation; Sortino ratio reported as 0"
                    .to_string(),
            );
            0.0
        };

        (volatility, sharpe, sortino)
    }

    /// Largest peak-to-trough fall in percent of the running peak.
    pub fn calculate_max_drawdown(values: &[f64]) -> f64 {
        let Some(first) = values.first() else {
            return 0.0;
        };
        let mut peak_value = *first;
        let mut max_drawdown_percent: f64 = 0.0;

        for value in values {
            if *value > peak_value {
                peak_value = *value;
            } else if peak_value > 0.0 {
                let drawdown_percent = (peak_value - value) / peak_value * 100.0;
                max_drawdown_percent = max_drawdown_percent.max(drawdown_percent);
            }
        }

        max_drawdown_percent.min(100.0)
    }

    /// Pairs every SELL with the oldest open buys of the same ticker. Fees are
    /// part of both the cost basis and the proceeds.
    pub fn closed_trades(trades: &[Trade]) -> Vec<ClosedTrade> {
        let mut lots: HashMap<&str, VecDeque<(f64, f64)>> = HashMap::new();
        let mut closed = Vec::new();

        for trade in trades {
            if trade.shares <= 0.0 {
                continue;
            }
            match trade.action {
                TradeAction::Buy => {
                    let unit_cost = (trade.value + trade.fees) / trade.shares;
                    lots.entry(trade.ticker.as_str())
                        .or_default()
                        .push_back((trade.shares, unit_cost));
                }
                TradeAction::Sell => {
                    let Some(queue) = lots.get_mut(trade.ticker.as_str()) else {
                        continue;
                    };
                    let mut remaining = trade.shares;
                    let mut matched = 0.0;
                    let mut cost = 0.0;
                    while remaining > 1e-12 {
                        let Some(front) = queue.front_mut() else {
                            break;
                        };
                        let take = remaining.min(front.0);
                        cost += take * front.1;
                        matched += take;
                        front.0 -= take;
                        remaining -= take;
                        if front.0 <= 1e-12 {
                            queue.pop_front();
                        }
                    }
                    if matched <= 0.0 || cost <= 0.0 {
                        continue;
                    }
                    let proceeds = (trade.value - trade.fees) * matched / trade.shares;
                    let pnl = proceeds - cost;
                    closed.push(ClosedTrade {
                        ticker: trade.ticker.clone(),
                        date: trade.date,
                        pnl,
                        pnl_percent: pnl / cost * 100.0,
                    });
                }
            }
        }

        closed
    }

    /// Calendar-year returns chained from the previous year's closing value.
    pub fn yearly_returns(equity_curve: &[EquityPoint], initial_capital: f64) -> Vec<YearlyReturn> {
        let mut year_ends: Vec<(i32, f64)> = Vec::new();
        for point in equity_curve {
            let year = point.date.year();
            if let Some(last) = year_ends.last_mut() {
                if last.0 == year {
                    last.1 = point.value;
                    continue;
                }
            }
            year_ends.push((year, point.value));
        }

        let mut start_value = initial_capital;
        year_ends
            .into_iter()
            .map(|(year, end_value)| {
                let return_pct = if start_value > 0.0 {
                    (end_value / start_value - 1.0) * 100.0
                } else {
                    0.0
                };
                let entry = YearlyReturn {
                    year,
                    start_value,
                    end_value,
                    return_pct,
                };
                start_value = end_value;
                entry
            })
            .collect()
    }

    fn apply_benchmark(
        metrics: &mut BacktestMetrics,
        equity_curve: &[EquityPoint],
        benchmark_curve: &[BenchmarkPoint],
        warnings: &mut Vec<String>,
    ) {
        let aligned = align_benchmark(equity_curve, benchmark_curve);
        if aligned.len() < 2 {
            warnings.push(
                "Benchmark series unavailable for the backtest window; alpha, beta and tracking error reported as 0"
                    .to_string(),
            );
            return;
        }

        let first_bench = aligned[0].1;
        let last_bench = aligned[aligned.len() - 1].1;
        let benchmark_return = if first_bench > 0.0 {
            (last_bench / first_bench - 1.0) * 100.0
        } else {
            0.0
        };
        metrics.benchmark_return = benchmark_return;

        let portfolio_values: Vec<f64> = aligned.iter().map(|(p, _)| *p).collect();
        let benchmark_values: Vec<f64> = aligned.iter().map(|(_, b)| *b).collect();
        let portfolio_returns = Self::period_returns(&portfolio_values);
        let benchmark_returns = Self::period_returns(&benchmark_values);

        let beta = if portfolio_returns.len() >= 2 {
            let variance = finite_or_zero(benchmark_returns.as_slice().variance());
            if variance > 0.0 {
                let covariance = finite_or_zero(
                    portfolio_returns
                        .as_slice()
                        .covariance(benchmark_returns.as_slice()),
                );
                covariance / variance
            } else {
                warnings.push("Benchmark returns have zero variance; beta reported as 0".to_string());
                0.0
            }
        } else {
            0.0
        };
        metrics.beta = beta;

        metrics.alpha = metrics.total_return - beta * benchmark_return;

        if portfolio_returns.len() >= 2 {
            let active: Vec<f64> = portfolio_returns
                .iter()
                .zip(&benchmark_returns)
                .map(|(p, b)| p - b)
                .collect();
            metrics.tracking_error =
                finite_or_zero(active.std_dev()) * metrics.annualization_factor.sqrt() * 100.0;
        }
    }

    fn average(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
}

/// Portfolio value paired with the benchmark close in force on each equity
/// date. Dates before the first benchmark close are dropped.
pub fn align_benchmark(
    equity_curve: &[EquityPoint],
    benchmark_curve: &[BenchmarkPoint],
) -> Vec<(f64, f64)> {
    equity_curve
        .iter()
        .filter_map(|point| {
            let idx = benchmark_curve.partition_point(|b| b.date <= point.date);
            if idx == 0 {
                None
            } else {
                Some((point.value, benchmark_curve[idx - 1].value))
            }
        })
        .collect()
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn curve(points: &[(NaiveDate, f64)]) -> Vec<EquityPoint> {
        points
            .iter()
            .map(|(date, value)| EquityPoint {
                date: *date,
                value: *value,
                cash: *value,
                invested: 0.0,
                positions: 0,
            })
            .collect()
    }

    fn trade(ticker: &str, action: TradeAction, shares: f64, price: f64, day: u32) -> Trade {
        Trade {
            date: date(2020, 1, day),
            ticker: ticker.to_string(),
            action,
            shares,
            price,
            fees: 0.0,
            value: shares * price,
            reason: String::new(),
        }
    }

    #[test]
    fn max_drawdown_uses_running_peak() {
        let dd = PerformanceCalculator::calculate_max_drawdown(&[100.0, 120.0, 90.0, 110.0]);
        assert!((dd - 25.0).abs() < 1e-9);
        assert!(PerformanceCalculator::calculate_max_drawdown(&[1.0, 2.0, 3.0]).abs() < 1e-12);
        assert!(PerformanceCalculator::calculate_max_drawdown(&[]).abs() < 1e-12);
    }

    #[test]
    fn cagr_over_one_year_matches_total_return() {
        let points = curve(&[(date(2020, 1, 1), 100_000.0), (date(2021, 1, 1), 110_000.0)]);
        let metrics = PerformanceCalculator::calculate(&points, &[], &[], 100_000.0);
        assert!((metrics.total_return - 10.0).abs() < 1e-9);
        let years = 366.0 / 365.25;
        let expected = (1.1_f64.powf(1.0 / years) - 1.0) * 100.0;
        assert!((metrics.cagr - expected).abs() < 1e-9);
    }

    #[test]
    fn same_day_curve_reports_zero_cagr_with_warning() {
        let points = curve(&[(date(2020, 1, 1), 100.0)]);
        let metrics = PerformanceCalculator::calculate(&points, &[], &[], 100.0);
        assert_eq!(metrics.cagr, 0.0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert!(metrics.warnings.iter().any(|w| w.contains("CAGR")));
    }

    #[test]
    fn annualization_infers_daily_spacing() {
        let dates: Vec<NaiveDate> = (0..5).map(|d| date(2020, 1, 1 + d)).collect();
        let factor = PerformanceCalculator::annualization_factor(&dates);
        assert!((factor - 365.25).abs() < 1e-9);
        let monthly = vec![date(2020, 1, 1), date(2020, 12, 31)];
        assert!(PerformanceCalculator::annualization_factor(&monthly) < 2.0);
    }

    #[test]
    fn fifo_pairing_counts_wins_and_losses() {
        let trades = vec![
            trade("A", TradeAction::Buy, 10.0, 10.0, 1),
            trade("A", TradeAction::Buy, 10.0, 20.0, 2),
            // consumes the first lot at 10 -> win
            trade("A", TradeAction::Sell, 10.0, 15.0, 3),
            // consumes the second lot at 20 -> loss
            trade("A", TradeAction::Sell, 10.0, 15.0, 4),
            trade("B", TradeAction::Buy, 5.0, 10.0, 1),
        ];
        let closed = PerformanceCalculator::closed_trades(&trades);
        assert_eq!(closed.len(), 2);
        assert!((closed[0].pnl_percent - 50.0).abs() < 1e-9);
        assert!((closed[1].pnl_percent + 25.0).abs() < 1e-9);

        let points = curve(&[(date(2020, 1, 1), 100.0), (date(2020, 1, 4), 100.0)]);
        let metrics = PerformanceCalculator::calculate(&points, &[], &trades, 100.0);
        assert!((metrics.win_rate - 50.0).abs() < 1e-9);
        assert_eq!(metrics.closed_trades, 2);
        assert_eq!(metrics.total_trades, 5);
    }

    #[test]
    fn benchmark_identical_to_portfolio_has_unit_beta() {
        let values = [100.0, 104.0, 101.0, 108.0, 107.0];
        let points = curve(
            &values
                .iter()
                .enumerate()
                .map(|(i, v)| (date(2020, 1, 1 + i as u32), *v))
                .collect::<Vec<_>>(),
        );
        let bench: Vec<BenchmarkPoint> = points
            .iter()
            .map(|p| BenchmarkPoint {
                date: p.date,
                value: p.value * 2.0,
            })
            .collect();
        let metrics = PerformanceCalculator::calculate(&points, &bench, &[], 100.0);
        assert!((metrics.beta - 1.0).abs() < 1e-9);
        assert!(metrics.alpha.abs() < 1e-9);
        assert!(metrics.tracking_error.abs() < 1e-9);
        assert!((metrics.benchmark_return - 7.0).abs() < 1e-9);
    }

    #[test]
    fn alpha_is_measured_against_initial_capital() {
        let points = curve(&[
            (date(2020, 1, 1), 99.0),
            (date(2020, 1, 2), 104.0),
            (date(2020, 1, 3), 101.0),
            (date(2020, 1, 4), 110.0),
        ]);
        let bench: Vec<BenchmarkPoint> = [100.0, 102.0, 101.0, 105.0]
            .iter()
            .zip(&points)
            .map(|(value, p)| BenchmarkPoint {
                date: p.date,
                value: *value,
            })
            .collect();
        let metrics = PerformanceCalculator::calculate(&points, &bench, &[], 100.0);
        assert!((metrics.total_return - 10.0).abs() < 1e-9);
        assert!((metrics.benchmark_return - 5.0).abs() < 1e-9);
        assert!((metrics.beta - 2.40989).abs() < 1e-4);
        assert!((metrics.alpha - (10.0 - metrics.beta * 5.0)).abs() < 1e-9);
        assert!((metrics.alpha + 2.04945).abs() < 1e-4);
    }

    #[test]
    fn missing_benchmark_degrades_to_zero() {
        let points = curve(&[
            (date(2020, 1, 1), 100.0),
            (date(2020, 1, 2), 101.0),
            (date(2020, 1, 3), 99.0),
        ]);
        let metrics = PerformanceCalculator::calculate(&points, &[], &[], 100.0);
        assert_eq!(metrics.beta, 0.0);
        assert_eq!(metrics.alpha, 0.0);
        assert!(metrics.warnings.iter().any(|w| w.contains("Benchmark")));
    }

    #[test]
    fn yearly_returns_chain_year_ends() {
        let points = curve(&[
            (date(2020, 1, 1), 100.0),
            (date(2020, 12, 31), 110.0),
            (date(2021, 6, 30), 99.0),
            (date(2021, 12, 31), 121.0),
        ]);
        let yearly = PerformanceCalculator::yearly_returns(&points, 100.0);
        assert_eq!(yearly.len(), 2);
        assert_eq!(yearly[0].year, 2020);
        assert!((yearly[0].return_pct - 10.0).abs() < 1e-9);
        assert!((yearly[1].start_value - 110.0).abs() < 1e-9);
        assert!((yearly[1].return_pct - 10.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn drawdown_stays_within_bounds(values in prop::collection::vec(0.01f64..1_000_000.0, 0..60)) {
            let dd = PerformanceCalculator::calculate_max_drawdown(&values);
            prop_assert!((0.0..=100.0).contains(&dd));
        }

        #[test]
        fn win_rate_stays_within_bounds(
            legs in prop::collection::vec((1.0f64..100.0, 1.0f64..100.0), 0..20)
        ) {
            let mut trades = Vec::new();
            for (i, (buy, sell)) in legs.iter().enumerate() {
                let ticker = format!("T{}", i % 3);
                trades.push(trade(&ticker, TradeAction::Buy, 1.0, *buy, 1));
                trades.push(trade(&ticker, TradeAction::Sell, 1.0, *sell, 2));
            }
            let points = curve(&[(date(2020, 1, 1), 100.0), (date(2020, 1, 2), 100.0)]);
            let metrics = PerformanceCalculator::calculate(&points, &[], &trades, 100.0);
            prop_assert!((0.0..=100.0).contains(&metrics.win_rate));
        }
    }
}
