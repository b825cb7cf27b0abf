use std::sync::Arc;

/// Everything the allocator reports to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Alloc,
    Free,
    Realloc,

    /// Data layer (and, in strict mode, memory layer) advanced together.
    JumpToNextLayer,
    /// Data advanced but the allocation backfilled an earlier memory layer.
    DataAdvancedMemoryBackfill,
    /// Allocation spilled into a memory layer other than the data layer.
    MemorySpillToOtherLayer,
    /// A memory layer crossed its MEM-TP byte threshold.
    LayerMemTPReached,
    /// The data layer hit its transitory layer point.
    LayerTLPReached,
    /// The data layer hit its hard phase boundary.
    LayerDataLPReached,
    /// A maintenance pass over the free lists ran.
    Scavenge,
    /// The request was satisfied by the fallback allocator.
    FallbackAlloc,
    /// No space in the arena and no (successful) fallback.
    OutOfMemory,
}

impl EventKind {
    /// Structural events are the ones the debug-pause controller reacts to;
    /// the plain per-operation events are excluded.
    pub(crate) fn is_structural(self) -> bool {
        !matches!(self, EventKind::Alloc | EventKind::Free | EventKind::Realloc)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventKind,
    pub data_layer: u32,
    pub mem_layer: u32,
    pub size: usize,
    pub note: Option<&'static str>,
}

/// User-supplied event observer.
///
/// The hook runs synchronously on whichever thread performed the triggering
/// operation; it must be prepared to be called from any of them.
pub type EventHook = Arc<dyn Fn(&Event) + Send + Sync>;
