//! Append-only allocation trace.

use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::fmt::Write as _;

/// One recorded placement. `penalty_cost` is zero when the block landed in
/// its own data layer, else the configured penalty factor.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceEntry {
    pub seq: u64,
    pub data_layer: u32,
    pub mem_layer: u32,
    pub size: usize,
    pub addr: usize,
    /// User pointer offset from the placed layer's begin (0 if it precedes
    /// it, which only fallback pointers do).
    pub layer_offset: usize,
    pub penalty_cost: f64,
    pub note: Option<&'static str>,
}

pub struct Tracer {
    enabled: AtomicBool,
    entries: Mutex<Vec<TraceEntry>>,
}

impl Tracer {
    pub(crate) fn new(enabled: bool) -> Self {
        Tracer {
            enabled: AtomicBool::new(enabled),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, entry: TraceEntry) {
        if !self.enabled() {
            return;
        }
        self.entries.lock().push(entry);
    }

    /// Copy of the trace so far.
    pub fn snapshot(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    /// Render the trace as CSV, header line first.
    pub fn to_csv(&self) -> String {
        let entries = self.entries.lock();
        let mut out = String::with_capacity(64 + entries.len() * 48);
        out.push_str("seq,data_layer,mem_layer,size,addr,layer_offset,penalty_cost,note\n");
        for e in entries.iter() {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{}",
                e.seq,
                e.data_layer,
                e.mem_layer,
                e.size,
                e.addr,
                e.layer_offset,
                e.penalty_cost,
                e.note.unwrap_or("")
            );
        }
        out
    }
}
