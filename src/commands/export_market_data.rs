use crate::data_context::MarketData;
use anyhow::Result;
use log::info;
use std::path::Path;

/// Converts a market data snapshot between formats, typically JSON to the
/// binary snapshot the engine loads by default.
pub fn run(input_path: &Path, output_path: &Path) -> Result<()> {
    info!(
        "Generating market data snapshot at {} from {}",
        output_path.display(),
        input_path.display()
    );

    let market_data = MarketData::load_from_file(input_path)?;
    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot successfully written to {} ({} securities)",
        output_path.display(),
        market_data.tickers().len()
    );

    Ok(())
}
