use crate::cache::ResultCache;
use crate::config::OptimizerSettings;
use crate::engine::BacktestRunner;
use crate::error::{EngineError, EngineResult};
use crate::job_status::{JobHandle, StopToken};
use crate::models::{BacktestMetrics, BacktestParams, BacktestResult};
use crate::param_utils::{describe_params, normalize, ParameterGrid};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationGoal {
    Growth,
    Income,
    Defensive,
    Sharpe,
    #[default]
    Balanced,
}

impl OptimizationGoal {
    pub fn label(self) -> &'static str {
        match self {
            Self::Growth => "growth",
            Self::Income => "income",
            Self::Defensive => "defensive",
            Self::Sharpe => "sharpe",
            Self::Balanced => "balanced",
        }
    }
}

impl FromStr for OptimizationGoal {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "growth" | "max_return" => Ok(Self::Growth),
            "income" => Ok(Self::Income),
            "defensive" | "min_drawdown" => Ok(Self::Defensive),
            "sharpe" | "max_sharpe" => Ok(Self::Sharpe),
            "" | "balanced" => Ok(Self::Balanced),
            other => Err(EngineError::validation(format!(
                "goal must be growth, income, defensive, sharpe or balanced (value: {})",
                other
            ))),
        }
    }
}

impl fmt::Display for OptimizationGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// The tunable part of a grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunedParams {
    pub pe_max: f64,
    pub roe_min: f64,
    pub pe_sell: f64,
    pub debt_equity_max: f64,
    pub max_positions: usize,
}

impl From<&BacktestParams> for TunedParams {
    fn from(params: &BacktestParams) -> Self {
        Self {
            pe_max: params.pe_max,
            roe_min: params.roe_min,
            pe_sell: params.pe_sell,
            debt_equity_max: params.debt_equity_max,
            max_positions: params.max_positions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationIteration {
    pub index: usize,
    pub params: TunedParams,
    pub metrics: Option<BacktestMetrics>,
    pub score: Option<f64>,
    pub data_issues: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    pub base: BacktestParams,
    pub grid: ParameterGrid,
    pub goal: OptimizationGoal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub goal: OptimizationGoal,
    pub best_params: BacktestParams,
    pub best_metrics: BacktestMetrics,
    pub best_score: f64,
    pub iterations: Vec<OptimizationIteration>,
    pub confidence: Confidence,
    pub warnings: Vec<String>,
    pub ai_analysis: Option<String>,
    pub explanation: String,
    pub cancelled: bool,
    #[serde(skip)]
    pub best_result: Option<Arc<BacktestResult>>,
}

/// Optional commentary on a finished search, e.g. a language-model summary.
pub trait OptimizationAdvisor: Send + Sync {
    fn analyze(&self, report: &OptimizationReport) -> anyhow::Result<String>;
}

enum GridOutcome {
    Finished {
        index: usize,
        result: Arc<BacktestResult>,
    },
    Failed {
        index: usize,
        error: String,
    },
    Skipped,
}

struct GridTask {
    index: usize,
    params: BacktestParams,
}

pub struct OptimizationEngine<'a> {
    runner: &'a dyn BacktestRunner,
    settings: OptimizerSettings,
    cache: ResultCache,
    stop: StopToken,
    job: Option<&'a JobHandle>,
    advisor: Option<&'a dyn OptimizationAdvisor>,
    show_progress: bool,
}

impl<'a> OptimizationEngine<'a> {
    pub fn new(runner: &'a dyn BacktestRunner, settings: OptimizerSettings) -> Self {
        Self {
            runner,
            settings,
            cache: ResultCache::new(),
            stop: StopToken::new(),
            job: None,
            advisor: None,
            show_progress: false,
        }
    }

    /// Reports progress to the job's status and honors its stop requests.
    pub fn with_job(mut self, job: &'a JobHandle) -> Self {
        self.stop = job.stop_token();
        self.job = Some(job);
        self
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_advisor(mut self, advisor: &'a dyn OptimizationAdvisor) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn optimize(&self, request: &OptimizeRequest) -> EngineResult<OptimizationReport> {
        request.base.validate()?;
        let points = request
            .grid
            .expand(&request.base, self.settings.max_grid_points)?;
        let total = points.len();
        info!(
            "Optimizing for {} goal over {} grid points",
            request.goal, total
        );
        if let Some(job) = self.job {
            job.set_total(total);
            job.set_message(format!("Running {} backtests", total));
        }

        let started = Instant::now();
        let (mut finished, mut failed) = self.run_grid(points.clone());
        finished.sort_by_key(|(index, _)| *index);
        failed.sort_by_key(|(index, _)| *index);
        let completed = finished.len() + failed.len();
        let cancelled = completed < total;
        info!(
            "Grid search finished in {:.1}s: {} succeeded, {} failed, {} skipped",
            started.elapsed().as_secs_f64(),
            finished.len(),
            failed.len(),
            total - completed
        );

        if finished.is_empty() {
            return Err(EngineError::NoSuccessfulIterations {
                failed: failed.len(),
                total,
            });
        }

        let mut warnings = Vec::new();
        let scoring_goal = if request.goal == OptimizationGoal::Income {
            warnings.push(
                "No dividend yield data available; income goal scored as balanced".to_string(),
            );
            OptimizationGoal::Balanced
        } else {
            request.goal
        };
        let scores = score_results(&finished, scoring_goal);

        let mut best_pos = 0;
        for (pos, score) in scores.iter().enumerate() {
            if *score > scores[best_pos] {
                best_pos = pos;
            }
        }
        let (best_index, best_result) = &finished[best_pos];
        let best_score = scores[best_pos];
        let runner_up = scores
            .iter()
            .enumerate()
            .filter(|(pos, _)| *pos != best_pos)
            .map(|(_, score)| *score)
            .fold(None, |acc: Option<f64>, score| {
                Some(acc.map_or(score, |current| current.max(score)))
            });
        let margin = runner_up.map(|second| best_score - second);

        let mut iterations: Vec<OptimizationIteration> = finished
            .iter()
            .zip(&scores)
            .map(|((index, result), score)| OptimizationIteration {
                index: *index,
                params: TunedParams::from(&points[*index]),
                metrics: Some(result.metrics.clone()),
                score: Some(*score),
                data_issues: result.errors.len(),
                error: None,
            })
            .chain(failed.iter().map(|(index, error)| OptimizationIteration {
                index: *index,
                params: TunedParams::from(&points[*index]),
                metrics: None,
                score: None,
                data_issues: 0,
                error: Some(error.clone()),
            }))
            .collect();
        iterations.sort_by_key(|iteration| iteration.index);

        let best_trades = best_result.metrics.total_trades;
        let confidence = self.confidence(finished.len(), best_trades, margin);

        if !failed.is_empty() {
            warnings.push(format!(
                "{} of {} grid points failed and were excluded",
                failed.len(),
                total
            ));
        }
        if cancelled {
            warnings.push(format!(
                "Optimization stopped after {} of {} grid points",
                completed, total
            ));
        }
        if finished.len() == 1 {
            warnings.push("Only one successful grid point; nothing to compare against".to_string());
        }
        if best_trades < self.settings.min_trades {
            warnings.push(format!(
                "Best configuration made only {} trades; results may not be significant",
                best_trades
            ));
        }
        if !best_result.errors.is_empty() {
            warnings.push(format!(
                "Best run hit {} data issues (missing prices or fundamentals)",
                best_result.errors.len()
            ));
        }

        let best_params = points[*best_index].clone();
        let explanation = format!(
            "Tested {} parameter sets for the {} goal. Best: {} with CAGR {:.2}%, Sharpe {:.2}, max drawdown {:.2}% and {} trades (score {:.3}{}).",
            completed,
            request.goal,
            describe_params(&best_params),
            best_result.metrics.cagr,
            best_result.metrics.sharpe_ratio,
            best_result.metrics.max_drawdown,
            best_trades,
            best_score,
            margin
                .map(|m| format!(", {:.3} ahead of the runner-up", m))
                .unwrap_or_default()
        );

        let mut report = OptimizationReport {
            goal: request.goal,
            best_params,
            best_metrics: best_result.metrics.clone(),
            best_score,
            iterations,
            confidence,
            warnings,
            ai_analysis: None,
            explanation,
            cancelled,
            best_result: Some(Arc::clone(best_result)),
        };

        if let Some(advisor) = self.advisor {
            match advisor.analyze(&report) {
                Ok(analysis) => report.ai_analysis = Some(analysis),
                Err(err) => {
                    warn!("Optimization analysis unavailable: {}", err);
                    report
                        .warnings
                        .push(format!("Analysis unavailable: {}", err));
                }
            }
        }

        Ok(report)
    }

    fn confidence(&self, successes: usize, best_trades: usize, margin: Option<f64>) -> Confidence {
        let Some(margin) = margin else {
            return Confidence::Low;
        };
        if successes < 2 || best_trades < self.settings.min_trades || margin < self.settings.thin_margin {
            Confidence::Low
        } else if margin >= self.settings.high_margin && best_trades >= self.settings.confident_trades
        {
            Confidence::High
        } else {
            Confidence::Medium
        }
    }

    #[allow(clippy::type_complexity)]
    fn run_grid(
        &self,
        points: Vec<BacktestParams>,
    ) -> (Vec<(usize, Arc<BacktestResult>)>, Vec<(usize, String)>) {
        let task_count = points.len();
        let num_workers = self.settings.worker_count(task_count);
        info!("Using {} worker threads", num_workers);

        let (tx, rx): (Sender<GridTask>, Receiver<GridTask>) = bounded(task_count);
        let (result_tx, result_rx): (Sender<GridOutcome>, Receiver<GridOutcome>) =
            bounded(task_count);

        let pb = if self.show_progress {
            ProgressBar::new(task_count as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut finished = Vec::new();
        let mut failed = Vec::new();

        thread::scope(|scope| {
            for _ in 0..num_workers {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                let runner = self.runner;
                let cache = &self.cache;
                let stop = &self.stop;
                scope.spawn(move || {
                    while let Ok(task) = rx.recv() {
                        let outcome = if stop.is_stopped() {
                            GridOutcome::Skipped
                        } else {
                            run_grid_point(runner, cache, task)
                        };
                        if result_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (index, params) in points.into_iter().enumerate() {
                if tx.send(GridTask { index, params }).is_err() {
                    break;
                }
            }
            drop(tx);

            let mut processed = 0;
            for outcome in result_rx.iter() {
                processed += 1;
                pb.set_position(processed as u64);
                match outcome {
                    GridOutcome::Finished { index, result } => {
                        if let Some(job) = self.job {
                            job.set_progress(processed, Some(describe_params(&result.params)));
                        }
                        finished.push((index, result));
                    }
                    GridOutcome::Failed { index, error } => {
                        warn!("Grid point {} failed: {}", index, error);
                        if let Some(job) = self.job {
                            job.set_progress::<String>(processed, None);
                        }
                        failed.push((index, error));
                    }
                    GridOutcome::Skipped => {}
                }
            }
        });

        if failed.is_empty() {
            pb.finish_with_message("Backtesting completed");
        } else {
            pb.finish_with_message("Backtesting completed with errors");
        }
        (finished, failed)
    }
}

fn run_grid_point(runner: &dyn BacktestRunner, cache: &ResultCache, task: GridTask) -> GridOutcome {
    let GridTask { index, params } = task;
    if let Some(result) = cache.get(&params) {
        return GridOutcome::Finished { index, result };
    }
    let run = match panic::catch_unwind(AssertUnwindSafe(|| runner.run(&params))) {
        Ok(run) => run,
        Err(payload) => {
            return GridOutcome::Failed {
                index,
                error: format!("backtest panicked: {}", panic_message(payload.as_ref())),
            }
        }
    };
    match run {
        Ok(result) => {
            let result = Arc::new(result);
            cache.store(&params, Arc::clone(&result));
            info!(
                "Grid point {} ({}): CAGR {:.2}%, Sharpe {:.2}, max DD {:.2}%",
                index,
                describe_params(&params),
                result.metrics.cagr,
                result.metrics.sharpe_ratio,
                result.metrics.max_drawdown
            );
            GridOutcome::Finished { index, result }
        }
        Err(err) => GridOutcome::Failed {
            index,
            error: err.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Goal-weighted composite of min-max normalized CAGR, Sharpe and drawdown.
fn score_results(results: &[(usize, Arc<BacktestResult>)], goal: OptimizationGoal) -> Vec<f64> {
    let cagr = normalize(&results.iter().map(|(_, r)| r.metrics.cagr).collect::<Vec<_>>());
    let sharpe = normalize(
        &results
            .iter()
            .map(|(_, r)| r.metrics.sharpe_ratio)
            .collect::<Vec<_>>(),
    );
    let drawdown = normalize(
        &results
            .iter()
            .map(|(_, r)| -r.metrics.max_drawdown)
            .collect::<Vec<_>>(),
    );

    let (w_cagr, w_sharpe, w_drawdown) = match goal {
        OptimizationGoal::Growth => (0.6, 0.2, 0.2),
        OptimizationGoal::Defensive => (0.1, 0.4, 0.5),
        OptimizationGoal::Sharpe => (0.2, 0.6, 0.2),
        OptimizationGoal::Income | OptimizationGoal::Balanced => (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0),
    };

    (0..results.len())
        .map(|i| w_cagr * cagr[i] + w_sharpe * sharpe[i] + w_drawdown * drawdown[i])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_status::JobSlot;
    use crate::models::BacktestMetrics;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake runner: CAGR grows with pe_max, drawdown with max_positions.
    struct ScriptedRunner {
        fail_pe_max: Option<f64>,
        calls: AtomicUsize,
        trades: usize,
    }

    impl ScriptedRunner {
        fn new(fail_pe_max: Option<f64>) -> Self {
            Self {
                fail_pe_max,
                calls: AtomicUsize::new(0),
                trades: 40,
            }
        }
    }

    impl BacktestRunner for ScriptedRunner {
        fn run(&self, params: &BacktestParams) -> EngineResult<BacktestResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(params.pe_max) == self.fail_pe_max && params.roe_min == 10.0 {
                return Err(EngineError::Data("series truncated".to_string()));
            }
            let metrics = BacktestMetrics {
                cagr: params.pe_max,
                sharpe_ratio: params.roe_min / 10.0,
                max_drawdown: params.max_positions as f64,
                total_trades: self.trades,
                ..BacktestMetrics::default()
            };
            Ok(BacktestResult {
                id: None,
                name: None,
                params: params.clone(),
                metrics,
                equity_curve: Vec::new(),
                benchmark_curve: Vec::new(),
                trades: Vec::new(),
                errors: Vec::new(),
                final_positions: Vec::new(),
                yearly_returns: Vec::new(),
                screening_history: Vec::new(),
            })
        }
    }

    fn request(goal: OptimizationGoal) -> OptimizeRequest {
        OptimizeRequest {
            base: BacktestParams {
                start_date: NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                universe: vec!["AAA".to_string()],
                ..BacktestParams::default()
            },
            grid: ParameterGrid {
                pe_max: vec![8.0, 12.0, 15.0],
                roe_min: vec![8.0, 10.0, 12.0],
                pe_sell: vec![17.0],
                debt_equity_max: vec![100.0],
                max_positions: vec![20],
            },
            goal,
        }
    }

    fn settings() -> OptimizerSettings {
        OptimizerSettings {
            workers: 3,
            ..OptimizerSettings::default()
        }
    }

    #[test]
    fn parses_goals_and_aliases() {
        assert_eq!("max_return".parse::<OptimizationGoal>().unwrap(), OptimizationGoal::Growth);
        assert_eq!("min_drawdown".parse::<OptimizationGoal>().unwrap(), OptimizationGoal::Defensive);
        assert_eq!("max_sharpe".parse::<OptimizationGoal>().unwrap(), OptimizationGoal::Sharpe);
        assert_eq!(" Sharpe ".parse::<OptimizationGoal>().unwrap(), OptimizationGoal::Sharpe);
        assert_eq!(OptimizationGoal::Sharpe.to_string(), "sharpe");
        assert!("yolo".parse::<OptimizationGoal>().is_err());
    }

    #[test]
    fn failed_grid_point_is_recorded_and_excluded() {
        let runner = ScriptedRunner::new(Some(15.0));
        let engine = OptimizationEngine::new(&runner, settings());
        let report = engine.optimize(&request(OptimizationGoal::Growth)).unwrap();

        assert_eq!(report.iterations.len(), 9);
        let failures: Vec<&OptimizationIteration> =
            report.iterations.iter().filter(|it| it.error.is_some()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].params.pe_max, 15.0);
        assert!(report.warnings.iter().any(|w| w.contains("1 of 9")));
        // pe_max 15 still wins through its roe 12 sibling.
        assert_eq!(report.best_params.pe_max, 15.0);
        assert_eq!(report.best_params.roe_min, 12.0);
        let indices: Vec<usize> = report.iterations.iter().map(|it| it.index).collect();
        assert_eq!(indices, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn every_grid_point_failing_is_an_error() {
        struct Broken;
        impl BacktestRunner for Broken {
            fn run(&self, _params: &BacktestParams) -> EngineResult<BacktestResult> {
                Err(EngineError::Data("no data".to_string()))
            }
        }
        let err = OptimizationEngine::new(&Broken, settings())
            .optimize(&request(OptimizationGoal::Balanced))
            .unwrap_err();
        assert_eq!(err, EngineError::NoSuccessfulIterations { failed: 9, total: 9 });
    }

    #[test]
    fn invalid_base_dates_fail_before_running() {
        let runner = ScriptedRunner::new(None);
        let mut req = request(OptimizationGoal::Balanced);
        req.base.end_date = req.base.start_date;
        let err = OptimizationEngine::new(&runner, settings())
            .optimize(&req)
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn income_goal_falls_back_to_balanced_with_warning() {
        let runner = ScriptedRunner::new(None);
        let report = OptimizationEngine::new(&runner, settings())
            .optimize(&request(OptimizationGoal::Income))
            .unwrap();
        assert_eq!(report.goal, OptimizationGoal::Income);
        assert!(report.warnings.iter().any(|w| w.contains("income")));
    }

    #[test]
    fn defensive_goal_prefers_lower_drawdown() {
        let runner = ScriptedRunner::new(None);
        let mut req = request(OptimizationGoal::Defensive);
        req.grid.pe_max = vec![12.0];
        req.grid.roe_min = vec![10.0];
        req.grid.max_positions = vec![5, 30];
        let report = OptimizationEngine::new(&runner, settings())
            .optimize(&req)
            .unwrap();
        assert_eq!(report.best_params.max_positions, 5);
    }

    #[test]
    fn sharpe_goal_prefers_risk_adjusted_return() {
        // Higher pe_max buys CAGR, higher roe_min buys Sharpe.
        let runner = ScriptedRunner::new(None);
        let mut req = request(OptimizationGoal::Sharpe);
        req.grid.pe_max = vec![8.0, 15.0];
        req.grid.roe_min = vec![8.0, 12.0];
        req.grid.max_positions = vec![20];
        let sharpe = OptimizationEngine::new(&runner, settings())
            .optimize(&req)
            .unwrap();
        assert_eq!(sharpe.goal, OptimizationGoal::Sharpe);
        assert_eq!(sharpe.best_params.roe_min, 12.0);
        assert_eq!(sharpe.best_params.pe_max, 15.0);

        // A run trading CAGR for Sharpe wins under the sharpe goal only.
        struct Tradeoff;
        impl BacktestRunner for Tradeoff {
            fn run(&self, params: &BacktestParams) -> EngineResult<BacktestResult> {
                let mut result = ScriptedRunner::new(None).run(params)?;
                result.metrics.cagr = if params.pe_max > 10.0 { 20.0 } else { 5.0 };
                result.metrics.sharpe_ratio = if params.pe_max > 10.0 { 0.5 } else { 1.5 };
                result.metrics.max_drawdown = 10.0;
                Ok(result)
            }
        }
        let mut req = request(OptimizationGoal::Sharpe);
        req.grid.pe_max = vec![8.0, 15.0];
        req.grid.roe_min = vec![10.0];
        let sharpe = OptimizationEngine::new(&Tradeoff, settings())
            .optimize(&req)
            .unwrap();
        assert_eq!(sharpe.best_params.pe_max, 8.0);
        req.goal = OptimizationGoal::Growth;
        let growth = OptimizationEngine::new(&Tradeoff, settings())
            .optimize(&req)
            .unwrap();
        assert_eq!(growth.best_params.pe_max, 15.0);
    }

    #[test]
    fn panicking_grid_point_is_recorded_as_failed() {
        struct Panics;
        impl BacktestRunner for Panics {
            fn run(&self, params: &BacktestParams) -> EngineResult<BacktestResult> {
                if params.pe_max == 12.0 && params.roe_min == 8.0 {
                    panic!("index out of bounds");
                }
                ScriptedRunner::new(None).run(params)
            }
        }
        let report = OptimizationEngine::new(&Panics, settings())
            .optimize(&request(OptimizationGoal::Growth))
            .unwrap();
        assert_eq!(report.iterations.len(), 9);
        let failures: Vec<&OptimizationIteration> =
            report.iterations.iter().filter(|it| it.error.is_some()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].params.pe_max, 12.0);
        assert_eq!(failures[0].params.roe_min, 8.0);
        assert_eq!(
            failures[0].error.as_deref(),
            Some("backtest panicked: index out of bounds")
        );
        assert!(report.warnings.iter().any(|w| w.contains("1 of 9")));
    }

    #[test]
    fn confidence_reflects_trades_and_margin() {
        let runner = ScriptedRunner::new(None);
        let mut req = request(OptimizationGoal::Growth);
        req.grid.roe_min = vec![8.0, 12.0];
        let report = OptimizationEngine::new(&runner, settings())
            .optimize(&req)
            .unwrap();
        // Executed trades count, so a run with no round trips can still be confident.
        assert_eq!(report.best_metrics.closed_trades, 0);
        assert_eq!(report.confidence, Confidence::High);

        let thin = ScriptedRunner {
            trades: 2,
            ..ScriptedRunner::new(None)
        };
        let report = OptimizationEngine::new(&thin, settings())
            .optimize(&request(OptimizationGoal::Growth))
            .unwrap();
        assert_eq!(report.confidence, Confidence::Low);
        assert!(report.warnings.iter().any(|w| w.contains("only 2 trades")));
    }

    #[test]
    fn stop_before_start_runs_nothing() {
        let runner = ScriptedRunner::new(None);
        let slot = JobSlot::new();
        let job = slot.try_start("optimize", 0).unwrap();
        slot.request_stop();
        let err = OptimizationEngine::new(&runner, settings())
            .with_job(&job)
            .optimize(&request(OptimizationGoal::Growth))
            .unwrap_err();
        assert_eq!(err, EngineError::NoSuccessfulIterations { failed: 0, total: 9 });
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stopped_search_keeps_completed_iterations() {
        struct StopsAfter {
            inner: ScriptedRunner,
            limit: usize,
            stop: StopToken,
        }
        impl BacktestRunner for StopsAfter {
            fn run(&self, params: &BacktestParams) -> EngineResult<BacktestResult> {
                let result = self.inner.run(params);
                if self.inner.calls.load(Ordering::SeqCst) >= self.limit {
                    self.stop.request_stop();
                }
                result
            }
        }

        let stop = StopToken::new();
        let runner = StopsAfter {
            inner: ScriptedRunner::new(None),
            limit: 3,
            stop: stop.clone(),
        };
        let single = OptimizerSettings {
            workers: 1,
            ..OptimizerSettings::default()
        };
        let report = OptimizationEngine::new(&runner, single)
            .with_stop_token(stop)
            .optimize(&request(OptimizationGoal::Growth))
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.iterations.len(), 3);
        assert!(report.warnings.iter().any(|w| w.contains("stopped after 3 of 9")));
    }

    #[test]
    fn cached_points_are_not_rerun() {
        let runner = ScriptedRunner::new(None);
        let cache = ResultCache::new();
        let engine = OptimizationEngine::new(&runner, settings()).with_cache(cache.clone());
        engine.optimize(&request(OptimizationGoal::Growth)).unwrap();
        engine.optimize(&request(OptimizationGoal::Growth)).unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 9);
        assert_eq!(cache.hits(), 9);
    }

    #[test]
    fn advisor_output_is_attached() {
        struct Echo;
        impl OptimizationAdvisor for Echo {
            fn analyze(&self, report: &OptimizationReport) -> anyhow::Result<String> {
                Ok(format!("best score {:.2}", report.best_score))
            }
        }
        let runner = ScriptedRunner::new(None);
        let report = OptimizationEngine::new(&runner, settings())
            .with_advisor(&Echo)
            .optimize(&request(OptimizationGoal::Growth))
            .unwrap();
        assert!(report.ai_analysis.unwrap().starts_with("best score"));
        assert!(report.explanation.contains("Tested 9 parameter sets"));
    }
}
