//! The explicit lifecycle owner for stations.
//!
//! Stations register their stop hooks here when they start; the workshop
//! trips every surviving hook on close. Hooks are held weakly, so the
//! custodian never extends a station's lifetime.

use std::sync::{Arc, Mutex, Weak};

use crate::station::StopHook;

/// Tracks stop hooks of live stations, weakly.
#[derive(Clone, Default)]
pub struct Custodian {
    hooks: Arc<Mutex<Vec<Weak<StopHook>>>>,
}

impl Custodian {
    /// An empty custodian.
    pub fn new() -> Self {
        Custodian::default()
    }

    /// Starts tracking a station's stop hook.
    pub fn track(&self, hook: &Arc<StopHook>) {
        let mut hooks = self.hooks.lock().expect("custodian lock");
        hooks.retain(|weak| weak.strong_count() > 0);
        hooks.push(Arc::downgrade(hook));
    }

    /// Trips every surviving hook and forgets them all.
    pub fn stop_all(&self) {
        let hooks: Vec<Weak<StopHook>> = {
            let mut guard = self.hooks.lock().expect("custodian lock");
            guard.drain(..).collect()
        };
        for weak in hooks {
            if let Some(hook) = weak.upgrade() {
                hook.trip();
            }
        }
    }

    /// Number of hooks still alive.
    pub fn live(&self) -> usize {
        self.hooks
            .lock()
            .expect("custodian lock")
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
