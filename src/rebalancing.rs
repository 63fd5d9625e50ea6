use crate::allocation::{AllocationCandidate, AllocationEngine};
use crate::config::RebalanceThresholds;
use crate::models::{
    HoldingSnapshot, Imbalance, ImbalanceType, PortfolioSnapshot, RebalanceAction,
    RebalanceProposal, Severity, WeightingMethod,
};
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;

/// Boundary slack so that exactly-on-threshold deviations classify upward.
const THRESHOLD_SLACK: f64 = 1e-9;
const PE_SELL_LEVEL: f64 = 25.0;
const SECTOR_CRITICAL_MARGIN: f64 = 10.0;
/// Scores at or below this share of the floor are critical.
const SCORE_CRITICAL_FRACTION: f64 = 0.5;
/// Scores below this share of the floor call for a sale.
const SCORE_SELL_FRACTION: f64 = 0.75;
const NEGATIVE_VERDICTS: [&str; 5] = ["ecarter", "écarter", "vendre", "sell", "avoid"];
const UNKNOWN_SECTOR: &str = "Other";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceAnalysis {
    pub total_portfolio_value: f64,
    pub num_positions: usize,
    pub is_balanced: bool,
    pub imbalances: Vec<Imbalance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalancePlan {
    pub proposals: Vec<RebalanceProposal>,
    pub total_buy: f64,
    pub total_sell: f64,
    pub net_flow: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceSimulation {
    pub before: BTreeMap<String, f64>,
    pub after: BTreeMap<String, f64>,
    pub sectors_before: BTreeMap<String, f64>,
    pub sectors_after: BTreeMap<String, f64>,
    pub max_weight_before: f64,
    pub max_weight_after: f64,
    pub max_weight_reduction: f64,
}

/// Current and target weight of one held line, in percent of total value.
struct WeightedHolding<'a> {
    holding: &'a HoldingSnapshot,
    current_weight: f64,
    target_weight: f64,
}

impl WeightedHolding<'_> {
    fn deviation(&self) -> f64 {
        self.current_weight - self.target_weight
    }

    fn sector(&self) -> &str {
        sector_of(self.holding)
    }
}

/// Compares a live portfolio with its target allocation.
pub struct RebalanceProposer {
    thresholds: RebalanceThresholds,
}

impl RebalanceProposer {
    pub fn new(thresholds: RebalanceThresholds) -> Self {
        Self { thresholds }
    }

    pub fn analyze(&self, snapshot: &PortfolioSnapshot, method: WeightingMethod) -> RebalanceAnalysis {
        let (total, weighted) = self.weigh(snapshot, method);
        let invested_weight: f64 = weighted.iter().map(|l| l.current_weight).sum();
        let position_cap = self.position_cap(weighted.len(), invested_weight);
        let mut imbalances = Vec::new();

        for line in &weighted {
            let holding = line.holding;
            let deviation = line.deviation();
            let mut flagged_light = false;
            let mut flagged_heavy = false;

            if let Some(severity) = self.deviation_severity(deviation) {
                let (kind, action, direction) = if deviation > 0.0 {
                    flagged_heavy = true;
                    (ImbalanceType::Overweight, RebalanceAction::Reduce, "above")
                } else {
                    flagged_light = true;
                    (ImbalanceType::Underweight, RebalanceAction::Increase, "below")
                };
                imbalances.push(Imbalance {
                    ticker: holding.ticker.clone(),
                    name: display_name(holding),
                    kind,
                    severity,
                    current_value: line.current_weight,
                    threshold: line.target_weight,
                    message: format!(
                        "{} is {:.1}pp {} its {:.1}% target ({:.1}% held)",
                        holding.ticker,
                        deviation.abs(),
                        direction,
                        line.target_weight,
                        line.current_weight
                    ),
                    suggested_action: action,
                });
            }

            if let Some(cap) = position_cap.filter(|cap| {
                !flagged_heavy && !flagged_light && line.current_weight > *cap + THRESHOLD_SLACK
            }) {
                let severity = if line.current_weight > cap + self.thresholds.deviation_critical {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                imbalances.push(Imbalance {
                    ticker: holding.ticker.clone(),
                    name: display_name(holding),
                    kind: ImbalanceType::Overweight,
                    severity,
                    current_value: line.current_weight,
                    threshold: cap,
                    message: format!(
                        "{} is a {:.1}% position (maximum {:.1}%)",
                        holding.ticker, line.current_weight, cap
                    ),
                    suggested_action: RebalanceAction::Reduce,
                });
            }

            if !flagged_light
                && line.current_weight > 0.0
                && line.current_weight < self.thresholds.min_position_weight
            {
                imbalances.push(Imbalance {
                    ticker: holding.ticker.clone(),
                    name: display_name(holding),
                    kind: ImbalanceType::Underweight,
                    severity: Severity::Warning,
                    current_value: line.current_weight,
                    threshold: self.thresholds.min_position_weight,
                    message: format!(
                        "{} is a {:.1}% position (minimum {:.1}%)",
                        holding.ticker, line.current_weight, self.thresholds.min_position_weight
                    ),
                    suggested_action: RebalanceAction::Increase,
                });
            }

            if let Some(pe) = holding.fundamentals.as_ref().and_then(|f| f.pe) {
                if pe > self.thresholds.max_pe {
                    let severity = if pe > self.thresholds.max_pe * 1.5 {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    };
                    imbalances.push(Imbalance {
                        ticker: holding.ticker.clone(),
                        name: display_name(holding),
                        kind: ImbalanceType::PeHigh,
                        severity,
                        current_value: pe,
                        threshold: self.thresholds.max_pe,
                        message: format!(
                            "{} trades at PE {:.1} (max {:.1})",
                            holding.ticker, pe, self.thresholds.max_pe
                        ),
                        suggested_action: if pe >= PE_SELL_LEVEL {
                            RebalanceAction::Sell
                        } else {
                            RebalanceAction::Reduce
                        },
                    });
                }
            }

            if let Some(score) = holding.fundamentals.as_ref().map(|f| f.effective_score()) {
                let floor = self.thresholds.min_score;
                if score < floor {
                    imbalances.push(Imbalance {
                        ticker: holding.ticker.clone(),
                        name: display_name(holding),
                        kind: ImbalanceType::ScoreDeterioration,
                        severity: if score <= floor * SCORE_CRITICAL_FRACTION {
                            Severity::Critical
                        } else {
                            Severity::Warning
                        },
                        current_value: score,
                        threshold: floor,
                        message: format!(
                            "{} quality score fell to {:.0}/100 (min {:.0})",
                            holding.ticker, score, floor
                        ),
                        suggested_action: if score < floor * SCORE_SELL_FRACTION {
                            RebalanceAction::Sell
                        } else {
                            RebalanceAction::Reduce
                        },
                    });
                }
            }

            if let Some(verdict) = negative_verdict(holding) {
                imbalances.push(Imbalance {
                    ticker: holding.ticker.clone(),
                    name: display_name(holding),
                    kind: ImbalanceType::VerdictChanged,
                    severity: Severity::Critical,
                    current_value: 0.0,
                    threshold: 0.0,
                    message: format!("{} verdict changed to '{}'", holding.ticker, verdict),
                    suggested_action: RebalanceAction::Sell,
                });
            }
        }

        for (sector, weight) in sector_weights(weighted.iter().map(|l| (l.sector(), l.current_weight))) {
            if weight > self.thresholds.max_sector_weight {
                let severity = if weight > self.thresholds.max_sector_weight + SECTOR_CRITICAL_MARGIN {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                imbalances.push(Imbalance {
                    ticker: sector.clone(),
                    name: format!("Sector {}", sector),
                    kind: ImbalanceType::SectorOverexposure,
                    severity,
                    current_value: weight,
                    threshold: self.thresholds.max_sector_weight,
                    message: format!(
                        "Sector {} is {:.1}% of the portfolio (max {:.1}%)",
                        sector, weight, self.thresholds.max_sector_weight
                    ),
                    suggested_action: RebalanceAction::Reduce,
                });
            }
        }

        imbalances.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| imbalance_rank(a.kind).cmp(&imbalance_rank(b.kind)))
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        debug!(
            "Rebalance analysis: {} positions, {} imbalances",
            weighted.len(),
            imbalances.len()
        );

        RebalanceAnalysis {
            total_portfolio_value: total,
            num_positions: weighted.len(),
            is_balanced: imbalances.is_empty(),
            imbalances,
        }
    }

    pub fn propose(&self, snapshot: &PortfolioSnapshot, method: WeightingMethod) -> RebalancePlan {
        let (total, weighted) = self.weigh(snapshot, method);
        let mut proposals = Vec::new();

        for line in &weighted {
            let holding = line.holding;
            let deviation = line.deviation();
            let (action, reason) = if line.target_weight <= 0.0 {
                (
                    RebalanceAction::Sell,
                    format!("No target weight under {} weighting", method.as_str()),
                )
            } else if deviation >= self.thresholds.deviation_warning - THRESHOLD_SLACK {
                (
                    RebalanceAction::Reduce,
                    format!("Overweight by {:.1}pp", deviation.abs()),
                )
            } else if deviation <= -self.thresholds.deviation_warning + THRESHOLD_SLACK {
                (
                    RebalanceAction::Increase,
                    format!("Underweight by {:.1}pp", deviation.abs()),
                )
            } else {
                continue;
            };

            let trade_value = (line.target_weight - line.current_weight) / 100.0 * total;
            proposals.push(RebalanceProposal {
                ticker: holding.ticker.clone(),
                name: display_name(holding),
                action,
                current_weight: line.current_weight,
                target_weight: line.target_weight,
                deviation,
                current_value: holding.market_value(),
                trade_value,
                shares_to_trade: trade_value / holding.current_price,
                current_price: holding.current_price,
                reason,
            });
        }

        proposals.sort_by(|a, b| {
            b.deviation
                .abs()
                .total_cmp(&a.deviation.abs())
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        let total_buy: f64 = proposals
            .iter()
            .filter(|p| p.trade_value > 0.0)
            .map(|p| p.trade_value)
            .sum();
        let total_sell: f64 = proposals
            .iter()
            .filter(|p| p.trade_value < 0.0)
            .map(|p| -p.trade_value)
            .sum();

        RebalancePlan {
            proposals,
            total_buy,
            total_sell,
            net_flow: total_buy - total_sell,
        }
    }

    /// Weights before and after moving every line to its target.
    pub fn simulate(&self, snapshot: &PortfolioSnapshot, method: WeightingMethod) -> RebalanceSimulation {
        let (_, weighted) = self.weigh(snapshot, method);

        let before: BTreeMap<String, f64> = weighted
            .iter()
            .map(|l| (l.holding.ticker.clone(), l.current_weight))
            .collect();
        let after: BTreeMap<String, f64> = weighted
            .iter()
            .map(|l| (l.holding.ticker.clone(), l.target_weight))
            .collect();
        let sectors_before = sector_weights(weighted.iter().map(|l| (l.sector(), l.current_weight)));
        let sectors_after = sector_weights(weighted.iter().map(|l| (l.sector(), l.target_weight)));

        let max_weight_before = before.values().copied().fold(0.0, f64::max);
        let max_weight_after = after.values().copied().fold(0.0, f64::max);

        RebalanceSimulation {
            before,
            after,
            sectors_before,
            sectors_after,
            max_weight_before,
            max_weight_after,
            max_weight_reduction: max_weight_before - max_weight_after,
        }
    }

    fn deviation_severity(&self, deviation: f64) -> Option<Severity> {
        let size = deviation.abs();
        if size >= self.thresholds.deviation_critical - THRESHOLD_SLACK {
            Some(Severity::Critical)
        } else if size >= self.thresholds.deviation_warning - THRESHOLD_SLACK {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// The maximum position weight, when `lines` can hold `invested_weight`
    /// without any of them exceeding it.
    fn position_cap(&self, lines: usize, invested_weight: f64) -> Option<f64> {
        let cap = self.thresholds.max_position_weight;
        (lines as f64 * cap >= invested_weight - THRESHOLD_SLACK).then_some(cap)
    }

    /// Total value and per-line weights. Lines without a usable price or
    /// quantity cannot be weighed and are left out.
    fn weigh<'a>(
        &self,
        snapshot: &'a PortfolioSnapshot,
        method: WeightingMethod,
    ) -> (f64, Vec<WeightedHolding<'a>>) {
        let held: Vec<&HoldingSnapshot> = snapshot
            .positions
            .iter()
            .filter(|holding| {
                let usable = holding.quantity > 0.0
                    && holding.current_price.is_finite()
                    && holding.current_price > 0.0;
                if !usable {
                    warn!(
                        "Skipping {} in rebalance: quantity {} price {}",
                        holding.ticker, holding.quantity, holding.current_price
                    );
                }
                usable
            })
            .collect();

        let invested: f64 = held.iter().map(|h| h.market_value()).sum();
        let total = invested + snapshot.cash.max(0.0);
        if held.is_empty() || total <= 0.0 {
            return (total.max(0.0), Vec::new());
        }
        let invested_fraction = invested / total;

        let candidates: Vec<AllocationCandidate> = held.iter().map(|h| candidate(h)).collect();
        let targets = AllocationEngine::target_weights(&candidates, method);

        let mut target_weights: Vec<f64> = held
            .iter()
            .map(|holding| targets.get(&holding.ticker).copied().unwrap_or(0.0) * invested_fraction * 100.0)
            .collect();
        if let Some(cap) = self.position_cap(held.len(), invested_fraction * 100.0) {
            cap_weights(&mut target_weights, cap);
        }

        let weighted = held
            .into_iter()
            .zip(target_weights)
            .map(|(holding, target_weight)| WeightedHolding {
                holding,
                current_weight: holding.market_value() / total * 100.0,
                target_weight,
            })
            .collect();
        (total, weighted)
    }
}

fn candidate(holding: &HoldingSnapshot) -> AllocationCandidate {
    let score = holding
        .fundamentals
        .as_ref()
        .map(|f| f.effective_score())
        .unwrap_or(0.0);
    // Without an explicit conviction, cheap high-quality lines weigh more.
    let conviction = holding.conviction.unwrap_or_else(|| {
        let pe = holding
            .fundamentals
            .as_ref()
            .and_then(|f| f.pe)
            .filter(|pe| *pe > 0.0)
            .unwrap_or(15.0);
        score / pe.clamp(1.0, 30.0)
    });
    AllocationCandidate {
        ticker: holding.ticker.clone(),
        score,
        conviction,
    }
}

/// Clips weights at `cap` and hands the excess to the lines still below it,
/// pro rata to their weight. Zero weights stay zero.
fn cap_weights(weights: &mut [f64], cap: f64) {
    for _ in 0..weights.len() {
        let excess: f64 = weights.iter().map(|w| (w - cap).max(0.0)).sum();
        if excess <= THRESHOLD_SLACK {
            return;
        }
        let room: f64 = weights.iter().filter(|w| **w < cap).sum();
        if room <= 0.0 {
            break;
        }
        for weight in weights.iter_mut() {
            if *weight >= cap {
                *weight = cap;
            } else {
                *weight += excess * *weight / room;
            }
        }
    }
    for weight in weights.iter_mut() {
        *weight = weight.min(cap);
    }
}

fn sector_of(holding: &HoldingSnapshot) -> &str {
    let sector = holding.sector.trim();
    if sector.is_empty() {
        UNKNOWN_SECTOR
    } else {
        sector
    }
}

fn sector_weights<'a, I>(lines: I) -> BTreeMap<String, f64>
where
    I: Iterator<Item = (&'a str, f64)>,
{
    let mut sectors = BTreeMap::new();
    for (sector, weight) in lines {
        *sectors.entry(sector.to_string()).or_insert(0.0) += weight;
    }
    sectors
}

fn display_name(holding: &HoldingSnapshot) -> String {
    if holding.name.trim().is_empty() {
        holding.ticker.clone()
    } else {
        holding.name.clone()
    }
}

fn negative_verdict(holding: &HoldingSnapshot) -> Option<&str> {
    let verdict = holding.verdict.as_deref()?.trim();
    let lowered = verdict.to_lowercase();
    NEGATIVE_VERDICTS
        .contains(&lowered.as_str())
        .then_some(verdict)
}

fn imbalance_rank(kind: ImbalanceType) -> u8 {
    match kind {
        ImbalanceType::VerdictChanged => 0,
        ImbalanceType::Overweight => 1,
        ImbalanceType::Underweight => 2,
        ImbalanceType::ScoreDeterioration => 3,
        ImbalanceType::SectorOverexposure => 4,
        ImbalanceType::PeHigh => 5,
    }
}
