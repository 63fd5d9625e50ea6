use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// Thresholds for the live rebalance proposer. Weights are in percent.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceThresholds {
    pub deviation_warning: f64,
    pub deviation_critical: f64,
    pub max_sector_weight: f64,
    pub min_position_weight: f64,
    /// Cap on any single line, also applied to target weights.
    pub max_position_weight: f64,
    pub max_pe: f64,
    /// Lowest acceptable quality score (0-100) for a held line.
    pub min_score: f64,
}

impl Default for RebalanceThresholds {
    fn default() -> Self {
        Self {
            deviation_warning: 5.0,
            deviation_critical: 10.0,
            max_sector_weight: 30.0,
            min_position_weight: 2.0,
            max_position_weight: 10.0,
            max_pe: 17.0,
            min_score: 40.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub max_grid_points: usize,
    pub min_trades: usize,
    pub confident_trades: usize,
    pub high_margin: f64,
    pub thin_margin: f64,
    /// 0 means one worker per CPU.
    pub workers: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_grid_points: 200,
            min_trades: 5,
            confident_trades: 20,
            high_margin: 0.10,
            thin_margin: 0.02,
            workers: 0,
        }
    }
}

impl OptimizerSettings {
    pub fn worker_count(&self, tasks: usize) -> usize {
        let available = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };
        std::cmp::min(tasks, std::cmp::max(1, available))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub rebalance: RebalanceThresholds,
    pub optimizer: OptimizerSettings,
    /// Oldest close (in days) still accepted as the price of a later date.
    pub price_staleness_days: i64,
    /// Trades smaller than this many shares are not worth executing.
    pub materiality_shares: f64,
    pub history_max_entries: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rebalance: RebalanceThresholds::default(),
            optimizer: OptimizerSettings::default(),
            price_staleness_days: 10,
            materiality_shares: 1.0,
            history_max_entries: 50,
        }
    }
}

impl EngineSettings {
    /// Missing keys keep their defaults; present but malformed keys are errors.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let deviation_warning = setting_f64(
            settings,
            "REBALANCE_DEVIATION_WARNING",
            defaults.rebalance.deviation_warning,
            Some(0.0),
            Some(100.0),
        )?;
        let deviation_critical = setting_f64(
            settings,
            "REBALANCE_DEVIATION_CRITICAL",
            defaults.rebalance.deviation_critical,
            Some(0.0),
            Some(100.0),
        )?;
        if deviation_critical < deviation_warning {
            return Err(anyhow!(
                "REBALANCE_DEVIATION_CRITICAL ({}) must be >= REBALANCE_DEVIATION_WARNING ({})",
                deviation_critical,
                deviation_warning
            ));
        }
        let max_sector_weight = setting_f64(
            settings,
            "REBALANCE_MAX_SECTOR_WEIGHT",
            defaults.rebalance.max_sector_weight,
            Some(0.0),
            Some(100.0),
        )?;
        let min_position_weight = setting_f64(
            settings,
            "REBALANCE_MIN_POSITION_WEIGHT",
            defaults.rebalance.min_position_weight,
            Some(0.0),
            Some(100.0),
        )?;
        let max_position_weight = setting_f64(
            settings,
            "REBALANCE_MAX_POSITION_WEIGHT",
            defaults.rebalance.max_position_weight,
            Some(0.0),
            Some(100.0),
        )?;
        if max_position_weight < min_position_weight {
            return Err(anyhow!(
                "REBALANCE_MAX_POSITION_WEIGHT ({}) must be >= REBALANCE_MIN_POSITION_WEIGHT ({})",
                max_position_weight,
                min_position_weight
            ));
        }
        let max_pe = setting_f64(
            settings,
            "REBALANCE_MAX_PE",
            defaults.rebalance.max_pe,
            Some(0.0),
            None,
        )?;
        let min_score = setting_f64(
            settings,
            "REBALANCE_MIN_SCORE",
            defaults.rebalance.min_score,
            Some(0.0),
            Some(100.0),
        )?;

        let max_grid_points = setting_usize(
            settings,
            "OPTIMIZER_MAX_GRID_POINTS",
            defaults.optimizer.max_grid_points,
            1,
        )?;
        let min_trades = setting_usize(
            settings,
            "OPTIMIZER_MIN_TRADES",
            defaults.optimizer.min_trades,
            0,
        )?;
        let confident_trades = setting_usize(
            settings,
            "OPTIMIZER_CONFIDENT_TRADES",
            defaults.optimizer.confident_trades,
            0,
        )?;
        let high_margin = setting_f64(
            settings,
            "OPTIMIZER_HIGH_MARGIN",
            defaults.optimizer.high_margin,
            Some(0.0),
            Some(1.0),
        )?;
        let thin_margin = setting_f64(
            settings,
            "OPTIMIZER_THIN_MARGIN",
            defaults.optimizer.thin_margin,
            Some(0.0),
            Some(1.0),
        )?;
        let workers = setting_usize(settings, "OPTIMIZER_WORKERS", defaults.optimizer.workers, 0)?;

        let price_staleness_days = setting_usize(
            settings,
            "PRICE_STALENESS_DAYS",
            defaults.price_staleness_days as usize,
            0,
        )? as i64;
        let materiality_shares = setting_f64(
            settings,
            "TRADE_MATERIALITY_SHARES",
            defaults.materiality_shares,
            Some(0.0),
            None,
        )?;
        let history_max_entries = setting_usize(
            settings,
            "HISTORY_MAX_ENTRIES",
            defaults.history_max_entries,
            1,
        )?;

        Ok(Self {
            rebalance: RebalanceThresholds {
                deviation_warning,
                deviation_critical,
                max_sector_weight,
                min_position_weight,
                max_position_weight,
                max_pe,
                min_score,
            },
            optimizer: OptimizerSettings {
                max_grid_points,
                min_trades,
                confident_trades,
                high_margin,
                thin_margin,
                workers,
            },
            price_staleness_days,
            materiality_shares,
            history_max_entries,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_map_yields_defaults() {
        let parsed = EngineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(parsed, EngineSettings::default());
        assert!((parsed.rebalance.deviation_warning - 5.0).abs() < 1e-9);
        assert!((parsed.rebalance.deviation_critical - 10.0).abs() < 1e-9);
    }

    #[test]
    fn overrides_are_applied() {
        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("REBALANCE_DEVIATION_WARNING", "3"),
            ("REBALANCE_DEVIATION_CRITICAL", " 7.5 "),
            ("OPTIMIZER_WORKERS", "2"),
            ("HISTORY_MAX_ENTRIES", "10"),
        ]))
        .unwrap();
        assert!((parsed.rebalance.deviation_warning - 3.0).abs() < 1e-9);
        assert!((parsed.rebalance.deviation_critical - 7.5).abs() < 1e-9);
        assert_eq!(parsed.optimizer.workers, 2);
        assert_eq!(parsed.optimizer.worker_count(10), 2);
        assert_eq!(parsed.optimizer.worker_count(1), 1);
        assert_eq!(parsed.history_max_entries, 10);
    }

    #[test]
    fn position_cap_and_score_floor_are_configurable() {
        let defaults = EngineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert!((defaults.rebalance.max_position_weight - 10.0).abs() < 1e-9);
        assert!((defaults.rebalance.min_score - 40.0).abs() < 1e-9);

        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("REBALANCE_MAX_POSITION_WEIGHT", "15"),
            ("REBALANCE_MIN_SCORE", "55"),
        ]))
        .unwrap();
        assert!((parsed.rebalance.max_position_weight - 15.0).abs() < 1e-9);
        assert!((parsed.rebalance.min_score - 55.0).abs() < 1e-9);

        assert!(EngineSettings::from_settings_map(&settings(&[
            ("REBALANCE_MAX_POSITION_WEIGHT", "1"),
        ]))
        .is_err());
        assert!(
            EngineSettings::from_settings_map(&settings(&[("REBALANCE_MIN_SCORE", "120")])).is_err()
        );
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(
            EngineSettings::from_settings_map(&settings(&[("PRICE_STALENESS_DAYS", "abc")]))
                .is_err()
        );
        assert!(
            EngineSettings::from_settings_map(&settings(&[("OPTIMIZER_MAX_GRID_POINTS", "1.5")]))
                .is_err()
        );
        assert!(EngineSettings::from_settings_map(&settings(&[
            ("REBALANCE_DEVIATION_WARNING", "12"),
            ("REBALANCE_DEVIATION_CRITICAL", "10"),
        ]))
        .is_err());
    }
}
