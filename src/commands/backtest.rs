use crate::api::{BacktestRequest, BacktestResponse};
use crate::context::AppContext;
use anyhow::Result;
use log::info;

/// Runs one backtest and optionally records it in the history.
pub fn run(app: &AppContext, request: BacktestRequest, save: Option<&str>) -> Result<BacktestResponse> {
    let (data, engine) = app.engine_with_data()?;
    let params = request.into_params(&data)?;
    info!(
        "Received backtest command: {} over {} tickers, {} - {}",
        params.display_name(),
        params.universe.len(),
        params.start_date,
        params.end_date
    );

    let result = engine.backtest(&params)?;
    info!(
        "Backtest finished: total return {:.2}%, CAGR {:.2}%, max drawdown {:.2}%, {} trades, {} data issues",
        result.metrics.total_return,
        result.metrics.cagr,
        result.metrics.max_drawdown,
        result.trades.len(),
        result.errors.len()
    );

    let saved_id = match save {
        Some(name) => Some(app.history().save(&result, Some(name).filter(|n| !n.is_empty()))?),
        None => None,
    };
    Ok(BacktestResponse::from_result(result, saved_id))
}
