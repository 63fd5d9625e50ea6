use crate::models::{TradeAction, WeightingMethod};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const WEIGHT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationCandidate {
    pub ticker: String,
    pub score: f64,
    /// Externally supplied weight, any positive scale.
    pub conviction: f64,
}

impl AllocationCandidate {
    pub fn equal(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            score: 0.0,
            conviction: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceOrder {
    pub ticker: String,
    pub action: TradeAction,
    pub shares: f64,
    pub price: f64,
}

pub struct AllocationEngine;

impl AllocationEngine {
    /// Weights summing to 1 over the candidate set. Score and conviction fall
    /// back to equal weighting when every input is zero.
    pub fn target_weights(
        candidates: &[AllocationCandidate],
        method: WeightingMethod,
    ) -> BTreeMap<String, f64> {
        if candidates.is_empty() {
            return BTreeMap::new();
        }

        let raw: Vec<f64> = match method {
            WeightingMethod::Equal => vec![1.0; candidates.len()],
            WeightingMethod::Score => candidates.iter().map(|c| sanitize(c.score)).collect(),
            WeightingMethod::Conviction => {
                candidates.iter().map(|c| sanitize(c.conviction)).collect()
            }
        };
        let total: f64 = raw.iter().sum();
        let equal = 1.0 / candidates.len() as f64;

        candidates
            .iter()
            .zip(raw)
            .map(|(candidate, value)| {
                let weight = if total > WEIGHT_EPSILON {
                    value / total
                } else {
                    equal
                };
                (candidate.ticker.clone(), weight)
            })
            .collect()
    }

    /// Target share counts. Tickers without a usable price get no allocation.
    pub fn allocate(
        candidates: &[AllocationCandidate],
        method: WeightingMethod,
        total_equity: f64,
        prices: &HashMap<String, f64>,
    ) -> BTreeMap<String, f64> {
        if !total_equity.is_finite() || total_equity <= 0.0 {
            return BTreeMap::new();
        }
        Self::target_weights(candidates, method)
            .into_iter()
            .filter_map(|(ticker, weight)| {
                let price = prices.get(&ticker).copied()?;
                if !price.is_finite() || price <= 0.0 {
                    return None;
                }
                Some((ticker, weight * total_equity / price))
            })
            .collect()
    }

    /// Orders moving `holdings` to `targets`: sells first, then buys, each in
    /// ticker order. Moves smaller than `materiality_shares` are skipped unless
    /// they close a position.
    pub fn rebalance_orders(
        targets: &BTreeMap<String, f64>,
        holdings: &BTreeMap<String, f64>,
        prices: &HashMap<String, f64>,
        materiality_shares: f64,
    ) -> Vec<RebalanceOrder> {
        let tickers: BTreeSet<&String> = targets.keys().chain(holdings.keys()).collect();
        let mut sells = Vec::new();
        let mut buys = Vec::new();

        for ticker in tickers {
            let Some(price) = prices.get(ticker).copied() else {
                continue;
            };
            let target = targets.get(ticker).copied().unwrap_or(0.0);
            let held = holdings.get(ticker).copied().unwrap_or(0.0);
            let delta = target - held;
            let closes_position = target <= WEIGHT_EPSILON && held > 0.0;

            if delta.abs() <= WEIGHT_EPSILON {
                continue;
            }
            if delta.abs() < materiality_shares && !closes_position {
                continue;
            }

            let order = RebalanceOrder {
                ticker: ticker.clone(),
                action: if delta > 0.0 {
                    TradeAction::Buy
                } else {
                    TradeAction::Sell
                },
                shares: delta.abs(),
                price,
            };
            if delta > 0.0 {
                buys.push(order);
            } else {
                sells.push(order);
            }
        }

        sells.extend(buys);
        sells
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(scores: &[(&str, f64)]) -> Vec<AllocationCandidate> {
        scores
            .iter()
            .map(|(ticker, score)| AllocationCandidate {
                ticker: ticker.to_string(),
                score: *score,
                conviction: *score,
            })
            .collect()
    }

    #[test]
    fn equal_weights_are_one_over_n() {
        let weights =
            AllocationEngine::target_weights(&candidates(&[("A", 1.0), ("B", 5.0), ("C", 9.0)]), WeightingMethod::Equal);
        for weight in weights.values() {
            assert!((weight - 1.0 / 3.0).abs() < 1e-12);
        }
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn score_weights_are_proportional() {
        let weights =
            AllocationEngine::target_weights(&candidates(&[("A", 30.0), ("B", 10.0)]), WeightingMethod::Score);
        assert!((weights["A"] - 0.75).abs() < 1e-12);
        assert!((weights["B"] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn all_zero_scores_fall_back_to_equal() {
        let weights =
            AllocationEngine::target_weights(&candidates(&[("A", 0.0), ("B", -3.0)]), WeightingMethod::Conviction);
        assert!((weights["A"] - 0.5).abs() < 1e-12);
        assert!((weights["B"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn allocate_converts_weights_to_shares() {
        let prices: HashMap<String, f64> =
            [("A".to_string(), 50.0), ("B".to_string(), 20.0)].into_iter().collect();
        let shares = AllocationEngine::allocate(
            &candidates(&[("A", 1.0), ("B", 1.0), ("C", 1.0)]),
            WeightingMethod::Equal,
            3_000.0,
            &prices,
        );
        assert!((shares["A"] - 20.0).abs() < 1e-9);
        assert!((shares["B"] - 50.0).abs() < 1e-9);
        assert!(!shares.contains_key("C"));
    }

    #[test]
    fn orders_sell_before_buy_and_skip_immaterial_moves() {
        let prices: HashMap<String, f64> = [
            ("A".to_string(), 10.0),
            ("B".to_string(), 10.0),
            ("C".to_string(), 10.0),
            ("D".to_string(), 10.0),
        ]
        .into_iter()
        .collect();
        let targets: BTreeMap<String, f64> =
            [("A".to_string(), 100.0), ("B".to_string(), 50.4), ("D".to_string(), 40.0)]
                .into_iter()
                .collect();
        let holdings: BTreeMap<String, f64> =
            [("B".to_string(), 50.0), ("C".to_string(), 0.5), ("D".to_string(), 60.0)]
                .into_iter()
                .collect();

        let orders = AllocationEngine::rebalance_orders(&targets, &holdings, &prices, 1.0);
        let summary: Vec<(&str, TradeAction, f64)> = orders
            .iter()
            .map(|o| (o.ticker.as_str(), o.action, o.shares))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("C", TradeAction::Sell, 0.5),
                ("D", TradeAction::Sell, 20.0),
                ("A", TradeAction::Buy, 100.0),
            ]
        );
    }
}
