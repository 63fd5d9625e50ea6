use crate::context::AppContext;
use crate::history::HistoryEntry;
use anyhow::Result;
use log::info;

pub fn list(app: &AppContext) -> Result<Vec<HistoryEntry>> {
    app.history().list()
}

pub fn rename(app: &AppContext, id: &str, name: &str) -> Result<()> {
    app.history().rename(id, name)?;
    info!("Renamed backtest {} to {}", id, name.trim());
    Ok(())
}

pub fn delete(app: &AppContext, id: &str) -> Result<()> {
    app.history().delete(id)?;
    info!("Deleted backtest {}", id);
    Ok(())
}
