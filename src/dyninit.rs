//! Dynamic initializer bookkeeping.
//!
//! Instrumented code brackets the dynamic initializers of each module with
//! `__asan_before_dynamic_init(module)` / `__asan_after_dynamic_init()`.
//! The tracker remembers which module is running its initializers and
//! which modules have finished, so initialization order problems can be
//! diagnosed.

use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

/// Tracks dynamic initializer brackets.
pub struct DynamicInitTracker {
    current: Mutex<Option<String>>,
    completed: Mutex<Vec<String>>,
}

impl DynamicInitTracker {
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(None),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// `module` starts running its dynamic initializers.
    pub fn begin(&self, module: &str) {
        let mut current = self.current.lock();
        if let Some(running) = current.as_ref() {
            log::warn!(
                "KASAN: dynamic init of {} started while {} is still running",
                module,
                running
            );
        }
        *current = Some(String::from(module));
        log::trace!("KASAN: dynamic init begin: {}", module);
    }

    /// The running module finished its dynamic initializers.
    pub fn end(&self) {
        let Some(module) = self.current.lock().take() else {
            log::warn!("KASAN: dynamic init end without matching begin");
            return;
        };
        log::trace!("KASAN: dynamic init end: {}", module);

        let mut completed = self.completed.lock();
        if !completed.iter().any(|m| *m == module) {
            completed.push(module);
        }
    }

    /// Module whose initializers are running.
    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }

    /// Whether `module` has finished its dynamic initializers.
    pub fn is_initialized(&self, module: &str) -> bool {
        self.completed.lock().iter().any(|m| m == module)
    }

    /// Modules that finished, in completion order.
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }
}

impl Default for DynamicInitTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_marks_module_initialized() {
        let tracker = DynamicInitTracker::new();
        tracker.begin("vmm");
        assert_eq!(tracker.current().as_deref(), Some("vmm"));
        assert!(!tracker.is_initialized("vmm"));

        tracker.end();
        assert_eq!(tracker.current(), None);
        assert!(tracker.is_initialized("vmm"));
    }

    #[test]
    fn test_unmatched_end_is_ignored() {
        let tracker = DynamicInitTracker::new();
        tracker.end();
        assert!(tracker.completed().is_empty());
    }

    #[test]
    fn test_module_recorded_once() {
        let tracker = DynamicInitTracker::new();
        for _ in 0..2 {
            tracker.begin("shell");
            tracker.end();
        }
        assert_eq!(tracker.completed().len(), 1);
    }
}
