//! Passive dependency container assembled once at startup and handed to
//! every transport-facing entry point (§4.6).
use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::distiller::Distiller;
use crate::hooks::HookManager;
use crate::scheduler::Scheduler;
use crate::secret::SecretScrubber;
use crate::store::MemoryStore;

/// Wires together the components a running daemon needs. Every accessor is
/// optional: callers must tolerate a component that was never wired (e.g. a
/// CLI invocation that only needs `MemoryStore`).
#[derive(Default)]
pub struct ServiceRegistry {
    store: Option<Arc<MemoryStore>>,
    distiller: Option<Arc<Distiller>>,
    scheduler: Option<Arc<Scheduler>>,
    checkpoint: Option<Arc<Checkpoint>>,
    hooks: Option<Arc<HookManager>>,
    scrubber: Option<Arc<SecretScrubber>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_distiller(mut self, distiller: Arc<Distiller>) -> Self {
        self.distiller = Some(distiller);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_scrubber(mut self, scrubber: Arc<SecretScrubber>) -> Self {
        self.scrubber = Some(scrubber);
        self
    }

    pub fn store(&self) -> Option<Arc<MemoryStore>> {
        self.store.clone()
    }

    pub fn distiller(&self) -> Option<Arc<Distiller>> {
        self.distiller.clone()
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.clone()
    }

    pub fn checkpoint(&self) -> Option<Arc<Checkpoint>> {
        self.checkpoint.clone()
    }

    pub fn hooks(&self) -> Option<Arc<HookManager>> {
        self.hooks.clone()
    }

    pub fn scrubber(&self) -> Option<Arc<SecretScrubber>> {
        self.scrubber.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_components_return_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.store().is_none());
        assert!(registry.distiller().is_none());
        assert!(registry.scheduler().is_none());
        assert!(registry.checkpoint().is_none());
        assert!(registry.hooks().is_none());
        assert!(registry.scrubber().is_none());
    }

    #[test]
    fn wired_hooks_component_is_returned() {
        let registry = ServiceRegistry::new().with_hooks(Arc::new(HookManager::new()));
        assert!(registry.hooks().is_some());
        assert!(registry.store().is_none());
    }

    #[test]
    fn wired_scrubber_component_is_returned() {
        let registry = ServiceRegistry::new().with_scrubber(Arc::new(SecretScrubber));
        assert!(registry.scrubber().is_some());
        assert!(registry.hooks().is_none());
    }
}
