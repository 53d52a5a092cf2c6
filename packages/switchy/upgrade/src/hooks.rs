//! Extension points around routine invocations.

use std::sync::Mutex;

/// Callbacks fired around every routine invocation.
///
/// `before_update` runs right before the routine body, `after_update` right
/// after it with whether the invocation succeeded.
#[allow(clippy::type_complexity)]
#[derive(Default)]
pub struct UpdateHooks {
    pub before_update: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub after_update: Option<Box<dyn Fn(&str, bool) + Send + Sync>>,
}

impl UpdateHooks {
    #[must_use]
    pub fn before_update(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.before_update = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn after_update(mut self, hook: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        self.after_update = Some(Box::new(hook));
        self
    }

    pub(crate) fn fire_before(&self, method_id: &str) {
        if let Some(ref hook) = self.before_update {
            hook(method_id);
        }
    }

    pub(crate) fn fire_after(&self, method_id: &str, success: bool) {
        if let Some(ref hook) = self.after_update {
            hook(method_id, success);
        }
    }
}

impl std::fmt::Debug for UpdateHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHooks")
            .field("before_update", &self.before_update.is_some())
            .field("after_update", &self.after_update.is_some())
            .finish()
    }
}

/// Where caught routine faults are reported.
pub trait FaultSink: Send + Sync {
    fn report(&self, method_id: &str, message: &str);
}

/// Reports faults through `log::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, method_id: &str, message: &str) {
        log::error!("Upgrade routine '{method_id}' failed: {message}");
    }
}

/// Prints faults to stderr for an operator watching an interactive run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleFaultSink;

impl FaultSink for ConsoleFaultSink {
    fn report(&self, method_id: &str, message: &str) {
        log::error!("Upgrade routine '{method_id}' failed: {message}");
        eprintln!("Error: {method_id}: {message}");
    }
}

/// Keeps reported faults for later display, e.g. at the end of a CLI run.
#[derive(Debug, Default)]
pub struct CollectingFaultSink {
    faults: Mutex<Vec<(String, String)>>,
}

impl CollectingFaultSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every fault reported so far.
    #[must_use]
    pub fn drain(&self) -> Vec<(String, String)> {
        self.faults
            .lock()
            .map(|mut faults| std::mem::take(&mut *faults))
            .unwrap_or_default()
    }
}

impl FaultSink for CollectingFaultSink {
    fn report(&self, method_id: &str, message: &str) {
        log::error!("Upgrade routine '{method_id}' failed: {message}");
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((method_id.to_string(), message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn hooks_fire_when_set() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let hooks = UpdateHooks::default()
            .before_update({
                let before = before.clone();
                move |_| {
                    before.fetch_add(1, Ordering::SeqCst);
                }
            })
            .after_update({
                let after = after.clone();
                move |_, success| {
                    if success {
                        after.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

        hooks.fire_before("a");
        hooks.fire_after("a", true);
        hooks.fire_after("a", false);

        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn unset_hooks_are_noops() {
        let hooks = UpdateHooks::default();
        hooks.fire_before("a");
        hooks.fire_after("a", true);
    }

    #[test_log::test]
    fn collecting_sink_drains() {
        let sink = CollectingFaultSink::new();
        sink.report("a", "boom");
        assert_eq!(sink.drain(), vec![("a".to_string(), "boom".to_string())]);
        assert!(sink.drain().is_empty());
    }
}
