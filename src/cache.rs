use crate::models::{BacktestParams, BacktestResult};
use crate::param_utils::parameter_signature;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory results keyed by parameter signature. Only valid for the market
/// data snapshot it was filled from.
#[derive(Clone, Default)]
pub struct ResultCache {
    entries: Arc<DashMap<String, Arc<BacktestResult>>>,
    hits: Arc<AtomicUsize>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, params: &BacktestParams) -> Option<Arc<BacktestResult>> {
        let found = self
            .entries
            .get(&parameter_signature(params))
            .map(|entry| Arc::clone(entry.value()));
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn store(&self, params: &BacktestParams, result: Arc<BacktestResult>) {
        self.entries.insert(parameter_signature(params), result);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}
