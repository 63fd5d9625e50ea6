use crate::models::{BacktestParams, Fundamentals, SignalAction};

/// Entry and exit thresholds the classifier needs. ROE and debt/equity in
/// percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThresholds {
    pub pe_max: f64,
    pub roe_min: f64,
    pub debt_equity_max: f64,
    pub pe_sell: f64,
    pub roe_min_hold: f64,
}

impl From<&BacktestParams> for SignalThresholds {
    fn from(params: &BacktestParams) -> Self {
        Self {
            pe_max: params.pe_max,
            roe_min: params.roe_min,
            debt_equity_max: params.debt_equity_max,
            pe_sell: params.pe_sell,
            roe_min_hold: params.roe_min_hold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalDecision {
    pub action: SignalAction,
    pub reason: String,
    /// Set when a held position could not be fully evaluated.
    pub data_warning: Option<String>,
}

impl SignalDecision {
    fn hold(reason: &str) -> Self {
        Self {
            action: SignalAction::Hold,
            reason: reason.to_string(),
            data_warning: None,
        }
    }
}

pub struct SignalEngine;

impl SignalEngine {
    pub fn classify(
        fundamentals: Option<&Fundamentals>,
        is_held: bool,
        thresholds: &SignalThresholds,
    ) -> SignalDecision {
        if is_held {
            Self::classify_held(fundamentals, thresholds)
        } else {
            Self::classify_candidate(fundamentals, thresholds)
        }
    }

    fn classify_candidate(
        fundamentals: Option<&Fundamentals>,
        thresholds: &SignalThresholds,
    ) -> SignalDecision {
        let Some(fundamentals) = fundamentals else {
            return SignalDecision::hold("no fundamentals");
        };
        let (Some(pe), Some(roe), Some(debt_equity)) =
            (fundamentals.pe, fundamentals.roe, fundamentals.debt_equity)
        else {
            return SignalDecision::hold("incomplete fundamentals");
        };

        // Loss-making companies report a negative or zero PE.
        let eligible = pe > 0.0
            && pe <= thresholds.pe_max
            && roe >= thresholds.roe_min
            && debt_equity <= thresholds.debt_equity_max;
        if eligible {
            SignalDecision {
                action: SignalAction::Buy,
                reason: format!("PE {:.1}, ROE {:.1}%, D/E {:.0}%", pe, roe, debt_equity),
                data_warning: None,
            }
        } else {
            SignalDecision::hold("screen not met")
        }
    }

    fn classify_held(
        fundamentals: Option<&Fundamentals>,
        thresholds: &SignalThresholds,
    ) -> SignalDecision {
        let pe = fundamentals.and_then(|f| f.pe);
        let roe = fundamentals.and_then(|f| f.roe);

        if let Some(pe) = pe {
            if pe > thresholds.pe_sell {
                return SignalDecision {
                    action: SignalAction::Sell,
                    reason: format!("PE {:.1} above sell threshold {}", pe, thresholds.pe_sell),
                    data_warning: None,
                };
            }
        }
        if let Some(roe) = roe {
            if roe < thresholds.roe_min_hold {
                return SignalDecision {
                    action: SignalAction::Sell,
                    reason: format!(
                        "ROE {:.1}% below hold threshold {}%",
                        roe, thresholds.roe_min_hold
                    ),
                    data_warning: None,
                };
            }
        }

        let mut missing = Vec::new();
        if pe.is_none() {
            missing.push("PE");
        }
        if roe.is_none() {
            missing.push("ROE");
        }
        let mut decision = SignalDecision::hold("still meets hold criteria");
        if !missing.is_empty() {
            decision.data_warning = Some(format!(
                "held position kept without {} data",
                missing.join("/")
            ));
        }
        decision
    }
}

/// 0-100 quality score built from valuation, profitability, leverage and
/// margin bands. Missing inputs contribute nothing.
pub fn quality_score(fundamentals: &Fundamentals) -> f64 {
    let mut score = 0.0;

    if let Some(pe) = fundamentals.pe.filter(|pe| *pe > 0.0) {
        score += if pe < 7.0 {
            35.0
        } else if pe < 10.0 {
            30.0
        } else if pe < 12.0 {
            25.0
        } else if pe < 15.0 {
            15.0
        } else if pe < 20.0 {
            5.0
        } else {
            0.0
        };
    }

    if let Some(roe) = fundamentals.roe {
        score += if roe >= 25.0 {
            30.0
        } else if roe >= 20.0 {
            25.0
        } else if roe >= 15.0 {
            20.0
        } else if roe >= 12.0 {
            15.0
        } else if roe >= 10.0 {
            10.0
        } else {
            0.0
        };
    }

    if let Some(debt_equity) = fundamentals.debt_equity {
        score += if debt_equity <= 0.0 {
            20.0
        } else if debt_equity <= 30.0 {
            15.0
        } else if debt_equity <= 50.0 {
            10.0
        } else if debt_equity <= 100.0 {
            5.0
        } else {
            0.0
        };
    }

    if let Some(margin) = fundamentals.net_margin {
        score += if margin >= 15.0 {
            15.0
        } else if margin >= 10.0 {
            10.0
        } else if margin >= 5.0 {
            5.0
        } else {
            0.0
        };
    }

    score
}
