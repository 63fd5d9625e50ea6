use crate::api::RebalanceRequest;
use crate::context::AppContext;
use crate::rebalancing::RebalanceProposer;
use anyhow::Result;
use log::info;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebalanceMode {
    Analyze,
    Propose,
    Simulate,
}

pub fn run(app: &AppContext, mode: RebalanceMode, request: &RebalanceRequest) -> Result<Value> {
    let settings = app.settings()?;
    let method = request.method()?;
    let proposer = RebalanceProposer::new(settings.rebalance);
    info!(
        "Received rebalance {:?} for {} positions ({} weighting)",
        mode,
        request.portfolio.positions.len(),
        method.as_str()
    );

    let value = match mode {
        RebalanceMode::Analyze => {
            let analysis = proposer.analyze(&request.portfolio, method);
            info!(
                "Portfolio value {:.2}: {} imbalances",
                analysis.total_portfolio_value,
                analysis.imbalances.len()
            );
            serde_json::to_value(analysis)?
        }
        RebalanceMode::Propose => {
            let plan = proposer.propose(&request.portfolio, method);
            info!(
                "{} proposals: buy {:.2}, sell {:.2}",
                plan.proposals.len(),
                plan.total_buy,
                plan.total_sell
            );
            serde_json::to_value(plan)?
        }
        RebalanceMode::Simulate => serde_json::to_value(proposer.simulate(&request.portfolio, method))?,
    };
    Ok(value)
}
