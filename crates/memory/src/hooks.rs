//! Lifecycle event dispatch for the transport layer: session start/end,
//! clear boundaries, and a context-usage threshold watcher that triggers
//! checkpointing with hysteresis.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    SessionStart,
    SessionEnd,
    BeforeClear,
    AfterClear,
    ContextThreshold,
}

/// A registered lifecycle callback. Handlers run synchronously and in
/// registration order; the first error aborts the remaining chain (§4.5).
pub type HookHandler = Box<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct HookManager {
    handlers: Mutex<HashMap<HookEvent, Vec<HookHandler>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: HookEvent, handler: HookHandler) {
        self.handlers.lock().unwrap().entry(event).or_default().push(handler);
    }

    /// Invokes every handler registered for `event` in order. Returns the
    /// first error encountered; handlers after it do not run.
    pub fn dispatch(&self, event: HookEvent) -> Result<()> {
        let handlers = self.handlers.lock().unwrap();
        if let Some(chain) = handlers.get(&event) {
            for handler in chain {
                handler()?;
            }
        }
        Ok(())
    }
}

const DEFAULT_THRESHOLD_PERCENT: u8 = 70;
const HYSTERESIS_MARGIN: u8 = 5;

/// Edge-triggered watcher over a context-usage gauge: fires exactly once per
/// crossing above `threshold`, and re-arms only once usage drops below
/// `threshold - HYSTERESIS_MARGIN` (§4.5).
pub struct ThresholdWatcher {
    threshold_percent: u8,
    armed: Mutex<bool>,
}

impl ThresholdWatcher {
    /// `threshold_percent` must be in `[1, 99]`.
    pub fn new(threshold_percent: u8) -> Self {
        Self {
            threshold_percent: threshold_percent.clamp(1, 99),
            armed: Mutex::new(true),
        }
    }

    pub fn with_default_threshold() -> Self {
        Self::new(DEFAULT_THRESHOLD_PERCENT)
    }

    /// Feed a usage sample; returns `true` exactly on the sample that crosses
    /// the threshold while armed.
    pub fn observe(&self, usage_percent: u8) -> bool {
        let mut armed = self.armed.lock().unwrap();
        if *armed && usage_percent >= self.threshold_percent {
            *armed = false;
            return true;
        }
        if !*armed && usage_percent < self.threshold_percent.saturating_sub(HYSTERESIS_MARGIN) {
            *armed = true;
        }
        false
    }
}

/// Wires a `ThresholdWatcher` to a checkpoint-save callback, invoked on each
/// rising crossing.
pub struct ThresholdHandler {
    watcher: ThresholdWatcher,
    on_crossing: Arc<dyn Fn() -> Result<()> + Send + Sync>,
}

impl ThresholdHandler {
    pub fn new(threshold_percent: u8, on_crossing: Arc<dyn Fn() -> Result<()> + Send + Sync>) -> Self {
        Self {
            watcher: ThresholdWatcher::new(threshold_percent),
            on_crossing,
        }
    }

    pub fn observe(&self, usage_percent: u8) -> Result<()> {
        if self.watcher.observe(usage_percent) {
            (self.on_crossing)()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ContextdError;

    #[test]
    fn dispatch_runs_handlers_in_registration_order() {
        let manager = HookManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        manager.register(
            HookEvent::SessionStart,
            Box::new(move || {
                o1.lock().unwrap().push(1);
                Ok(())
            }),
        );
        let o2 = order.clone();
        manager.register(
            HookEvent::SessionStart,
            Box::new(move || {
                o2.lock().unwrap().push(2);
                Ok(())
            }),
        );

        manager.dispatch(HookEvent::SessionStart).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn first_error_aborts_the_chain() {
        let manager = HookManager::new();
        let ran = Arc::new(AtomicUsize::new(0));

        manager.register(
            HookEvent::BeforeClear,
            Box::new(|| Err(ContextdError::invalid("boom"))),
        );
        let r = ran.clone();
        manager.register(
            HookEvent::BeforeClear,
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let err = manager.dispatch(HookEvent::BeforeClear).unwrap_err();
        assert!(matches!(err, ContextdError::Invalid(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn threshold_hysteresis_matches_spec_sample_sequence() {
        let watcher = ThresholdWatcher::new(70);
        let samples = [65, 72, 74, 63, 71];
        let crossings: Vec<bool> = samples.iter().map(|&s| watcher.observe(s)).collect();
        assert_eq!(crossings, vec![false, true, false, false, true]);
    }

    #[test]
    fn threshold_does_not_rearm_between_63_and_70() {
        // 63 is below the raw threshold but not below threshold - margin (65),
        // so the watcher must stay disarmed.
        let watcher = ThresholdWatcher::new(70);
        assert!(watcher.observe(72));
        assert!(!watcher.observe(66));
        assert!(!watcher.observe(71));
    }
}
