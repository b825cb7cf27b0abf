use crate::events::Event;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// Debug-pause controller.
///
/// When enabled, the calling thread sleeps for a configured number of
/// milliseconds after each structural event so a human can watch phase
/// transitions unfold in real time. Off by default; never consulted on the
/// plain alloc/free/realloc events.
pub(crate) struct HaltingController {
    enabled: AtomicBool,
    pause_ms: AtomicU32,
}

impl HaltingController {
    pub(crate) const fn new() -> Self {
        HaltingController {
            enabled: AtomicBool::new(false),
            pause_ms: AtomicU32::new(0),
        }
    }

    pub(crate) fn enable(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_pause_ms(&self, ms: u32) {
        self.pause_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn on_event(&self, event: &Event) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let ms = self.pause_ms.load(Ordering::Relaxed);
        if ms == 0 || !event.kind.is_structural() {
            return;
        }
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
