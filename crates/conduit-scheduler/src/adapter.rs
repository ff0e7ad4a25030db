use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{SourceId, SourceKind, SyncResult};

use crate::error::AdapterError;

/// Performs the actual pull from one kind of external system.
///
/// The scheduler bounds every call with the kind's execution window, so
/// implementations need not enforce their own timeout.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn sync_data(&self, source_id: &SourceId) -> Result<SyncResult, AdapterError>;
}

/// Adapters keyed by the kind they serve, fixed when the scheduler is built.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register `adapter` for its kind, returning any adapter it replaced.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.insert(adapter.kind(), adapter)
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn supports(&self, kind: SourceKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
