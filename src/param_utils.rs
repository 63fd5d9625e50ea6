use crate::error::{EngineError, EngineResult};
use crate::models::BacktestParams;
use serde::{Deserialize, Serialize};

/// Candidate values per tunable threshold. The grid is their cartesian
/// product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub pe_max: Vec<f64>,
    pub roe_min: Vec<f64>,
    pub pe_sell: Vec<f64>,
    pub debt_equity_max: Vec<f64>,
    pub max_positions: Vec<usize>,
}

impl Default for ParameterGrid {
    fn default() -> Self {
        Self {
            pe_max: vec![8.0, 12.0, 15.0],
            roe_min: vec![8.0, 10.0, 12.0],
            pe_sell: vec![17.0, 25.0],
            debt_equity_max: vec![50.0, 100.0, 150.0],
            max_positions: vec![10, 20],
        }
    }
}

impl ParameterGrid {
    pub fn point_count(&self) -> usize {
        self.pe_max.len()
            * self.roe_min.len()
            * self.pe_sell.len()
            * self.debt_equity_max.len()
            * self.max_positions.len()
    }

    /// Every combination applied on top of `base`, in a stable order (later
    /// dimensions vary fastest).
    pub fn expand(&self, base: &BacktestParams, max_points: usize) -> EngineResult<Vec<BacktestParams>> {
        let count = self.point_count();
        if count == 0 {
            return Err(EngineError::validation(
                "parameter grid needs at least one value per dimension",
            ));
        }
        if count > max_points {
            return Err(EngineError::validation(format!(
                "parameter grid has {} points, more than the limit of {}",
                count, max_points
            )));
        }
        let finite = self
            .pe_max
            .iter()
            .chain(&self.roe_min)
            .chain(&self.pe_sell)
            .chain(&self.debt_equity_max)
            .all(|value| value.is_finite());
        if !finite {
            return Err(EngineError::validation("parameter grid values must be finite"));
        }

        let mut points = Vec::with_capacity(count);
        for &pe_max in &self.pe_max {
            for &roe_min in &self.roe_min {
                for &pe_sell in &self.pe_sell {
                    for &debt_equity_max in &self.debt_equity_max {
                        for &max_positions in &self.max_positions {
                            points.push(BacktestParams {
                                pe_max,
                                roe_min,
                                pe_sell,
                                debt_equity_max,
                                max_positions,
                                ..base.clone()
                            });
                        }
                    }
                }
            }
        }
        Ok(points)
    }
}

/// Key identifying the tunable part of a parameter set.
pub fn parameter_signature(params: &BacktestParams) -> String {
    format!(
        "pe_max={}|roe_min={}|pe_sell={}|roe_min_hold={}|de_max={}|max_pos={}|freq={}|fee={}|{}..{}|cap={}|{}|{}",
        params.pe_max,
        params.roe_min,
        params.pe_sell,
        params.roe_min_hold,
        params.debt_equity_max,
        params.max_positions,
        params.rebalance_freq,
        params.fee_rate,
        params.start_date,
        params.end_date,
        params.initial_capital,
        params.benchmark,
        params.universe.join(",")
    )
}

/// Short human label for logs and explanations.
pub fn describe_params(params: &BacktestParams) -> String {
    format!(
        "PE<={} ROE>={}% sell PE>{} D/E<={}% max {} positions",
        params.pe_max, params.roe_min, params.pe_sell, params.debt_equity_max, params.max_positions
    )
}

/// Min-max scaling into [0, 1]. A flat input maps to 1 everywhere.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let min = finite.clone().fold(f64::INFINITY, f64::min);
    let max = finite.fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    values
        .iter()
        .map(|value| {
            if !value.is_finite() {
                0.0
            } else if range <= f64::EPSILON {
                1.0
            } else {
                (value - min) / range
            }
        })
        .collect()
}
