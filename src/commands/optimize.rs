use crate::api::OptimizeRequestBody;
use crate::context::{AppContext, OPTIMIZE_JOB};
use crate::optimizer::{OptimizationEngine, OptimizationReport};
use anyhow::Result;
use log::{info, warn};
use serde::Serialize;

/// Report fields at the top level, plus the history id of the saved best run.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeOutcome {
    #[serde(flatten)]
    pub report: OptimizationReport,
    pub saved_id: Option<String>,
}

/// Runs the grid search under the optimizer slot and stores the winning
/// backtest in the history.
pub fn run(app: &AppContext, body: OptimizeRequestBody, show_progress: bool) -> Result<OptimizeOutcome> {
    let job = app.optimizer_job().try_start(OPTIMIZE_JOB, 0)?;
    let (data, engine) = app.engine_with_data()?;
    let request = body.into_request(&data)?;
    info!(
        "Received optimize command: {} goal, {} tickers, {} - {}",
        request.goal,
        request.base.universe.len(),
        request.base.start_date,
        request.base.end_date
    );

    let outcome = OptimizationEngine::new(&engine, engine.settings().optimizer.clone())
        .with_job(&job)
        .with_progress_bar(show_progress)
        .optimize(&request);
    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            job.finish(format!("Optimization failed: {}", err));
            return Err(err.into());
        }
    };

    info!("{}", report.explanation);
    for warning in &report.warnings {
        warn!("{}", warning);
    }

    let saved_id = match report.best_result.as_deref() {
        Some(best) => {
            let name = format!("OPTIMAL {} {}", report.goal.label().to_uppercase(), best.params.display_name());
            Some(app.history().save(best, Some(&name))?)
        }
        None => None,
    };

    job.finish(format!(
        "Optimization finished: best score {:.3} ({:?} confidence)",
        report.best_score, report.confidence
    ));
    Ok(OptimizeOutcome { report, saved_id })
}
