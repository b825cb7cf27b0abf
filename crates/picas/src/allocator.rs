//! The allocator facade: arena lifecycle, placement, and the malloc-like
//! operation surface.

use crate::config::{Config, InitError};
use crate::events::{Event, EventHook, EventKind};
use crate::fallback::{self, Fallback};
use crate::halting::HaltingController;
use crate::layer::{BlockHeader, Layer, BLOCK_MAGIC, HEADER_SIZE, MIN_BLOCK_TOTAL};
use crate::platform::{self, Pages};
use crate::policy::{self, PolicyInput};
use crate::scavenger;
use crate::tracer::{TraceEntry, Tracer};
use crate::util::{align_up, is_aligned, MIN_ALIGN};
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use parking_lot::Mutex;

/// Magic identifying an align tag ("PICAALIG"). Cannot collide with the
/// block header at the same offset: the u64 there is the header's
/// data-layer and flags words, both always < the layer count.
const ALIGN_MAGIC: u64 = 0x5049_4341_414C_4947;

/// Tag placed immediately before an over-aligned user pointer. It is a
/// non-owning back-reference: freeing the aligned pointer resolves the tag
/// and delegates to the primary free path on `base`.
#[repr(C)]
struct AlignTag {
    magic: u64,
    /// Base pointer as returned by `malloc` (arena or fallback block).
    base: *mut u8,
    /// User-requested size.
    requested: usize,
}

const ALIGN_TAG_SIZE: usize = core::mem::size_of::<AlignTag>();

/// Aggregate arena counters. `total_live_est` is a non-authoritative
/// estimate; see the per-layer accounting notes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub total_reserved: usize,
    pub total_capacity: usize,
    pub total_live_est: usize,
}

/// A phase-aware layered allocator over one contiguous OS reservation.
///
/// All operations take `&self`; per-layer mutexes and relaxed atomics
/// provide the synchronization described in the module docs. The event
/// hook runs on whichever thread performed the triggering operation.
pub struct Picas {
    cfg: Config,
    num_layers: u32,

    pages: Pages,
    layers: Box<[Layer]>,
    fallback: Fallback,

    hook: Mutex<Option<EventHook>>,
    halter: HaltingController,
    tracer: Tracer,

    current_data_layer: AtomicU32,
    current_mem_layer: AtomicU32,

    data_alloc_count_in_layer: AtomicUsize,
    data_alloc_bytes_in_layer: AtomicUsize,

    alloc_seq: AtomicU64,
    ring_cursor: AtomicU32,
    allocs_since_scavenge: AtomicU64,
}

impl Picas {
    /// Sanitize the configuration, build the fallback subsystem, and
    /// reserve one arena sized to the sum of the page-aligned layer
    /// capacities.
    pub fn new(mut cfg: Config) -> Result<Self, InitError> {
        cfg.sanitize();
        let num_layers = cfg.num_layers;

        let fallback = Fallback::new(&cfg.safety.fallback)?;

        let page = platform::page_size();
        let mut caps = [0usize; crate::config::MAX_LAYERS];
        let mut total = 0usize;
        for (cap, layer_cfg) in caps
            .iter_mut()
            .zip(&cfg.mem_layers[..num_layers as usize])
        {
            *cap = align_up(layer_cfg.bytes, page);
            total += *cap;
        }

        let pages = platform::reserve_and_commit(total)
            .ok_or(InitError::ArenaReserveFailed { bytes: total })?;

        let mut layers = Vec::with_capacity(num_layers as usize);
        let mut offset = 0usize;
        for (i, &cap) in caps[..num_layers as usize].iter().enumerate() {
            let mem_tp = cfg.mem_layers[i].mem_tp_bytes.min(cap);
            // SAFETY: each range is a disjoint slice of the fresh
            // reservation, which lives until `Drop`.
            layers.push(unsafe { Layer::new(pages.base as usize + offset, cap, mem_tp) });
            offset += cap;
        }

        let halter = HaltingController::new();
        halter.enable(cfg.enable_debug_pause);
        halter.set_pause_ms(cfg.debug_pause_ms);

        tracing::debug!(
            num_layers,
            total_reserved = pages.size,
            "picas arena initialized"
        );

        Ok(Picas {
            num_layers,
            pages,
            layers: layers.into_boxed_slice(),
            fallback,
            hook: Mutex::new(None),
            halter,
            tracer: Tracer::new(cfg.enable_tracing),
            current_data_layer: AtomicU32::new(0),
            current_mem_layer: AtomicU32::new(0),
            data_alloc_count_in_layer: AtomicUsize::new(0),
            data_alloc_bytes_in_layer: AtomicUsize::new(0),
            alloc_seq: AtomicU64::new(0),
            ring_cursor: AtomicU32::new(0),
            allocs_since_scavenge: AtomicU64::new(0),
            cfg,
        })
    }

    /// Install (or replace) the event hook. The hook may run on any thread
    /// that calls into the allocator.
    pub fn set_event_hook(&self, hook: EventHook) {
        *self.hook.lock() = Some(hook);
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            total_reserved: self.pages.size,
            ..Stats::default()
        };
        for layer in self.layers.iter() {
            stats.total_capacity += layer.capacity();
            stats.total_live_est += layer.live_bytes_est();
        }
        stats
    }

    /// Index of the currently active phase.
    pub fn data_layer(&self) -> u32 {
        self.current_data_layer.load(Ordering::Relaxed)
    }

    /// Force the current data (and memory) layer. Clamped to the last
    /// layer; resets both progress counters.
    pub fn set_data_layer(&self, layer: u32) {
        let layer = layer.min(self.num_layers - 1);
        self.current_data_layer.store(layer, Ordering::Relaxed);
        self.current_mem_layer.store(layer, Ordering::Relaxed);
        self.data_alloc_count_in_layer.store(0, Ordering::Relaxed);
        self.data_alloc_bytes_in_layer.store(0, Ordering::Relaxed);
    }

    fn emit(&self, kind: EventKind, data_layer: u32, mem_layer: u32, size: usize, note: Option<&'static str>) {
        if !self.cfg.enable_event_hooks {
            return;
        }
        let event = Event {
            kind,
            data_layer,
            mem_layer,
            size,
            note,
        };
        // Clone the hook out of the lock so a hook that re-enters the
        // allocator cannot deadlock on it.
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&event);
        }
        self.halter.on_event(&event);
    }

    fn ptr_in_arena(&self, addr: usize) -> bool {
        let base = self.pages.base as usize;
        base != 0 && addr >= base && addr < base + self.pages.size
    }

    /// Any earlier memory layer (index < `upto`) still has usable space.
    fn any_prev_layer_incomplete(&self, upto: u32) -> bool {
        self.layers[..upto as usize].iter().any(|l| !l.is_full())
    }

    /// Earliest layer below `data_layer` with usable space, or
    /// `data_layer` itself when none qualifies.
    fn find_earliest_incomplete(&self, data_layer: u32) -> u32 {
        for (i, layer) in self.layers[..data_layer as usize].iter().enumerate() {
            if !layer.is_full() {
                return i as u32;
            }
        }
        data_layer
    }

    fn would_strand_too_much(&self, mem_layer: u32) -> bool {
        if mem_layer >= self.num_layers {
            return false;
        }
        self.layers[mem_layer as usize].remaining_bytes()
            > self.cfg.safety.anti_stranding.max_stranded_per_layer
    }

    /// Round-robin bounded probe: the preferred layer first, then at most
    /// `max_layer_probes` layers from the process-wide cursor. Returns the
    /// first layer with room for a minimum block.
    fn choose_layer_bounded(&self, preferred: u32) -> Option<u32> {
        let has_space =
            |li: u32| li < self.num_layers && self.layers[li as usize].has_room(MIN_BLOCK_TOTAL);

        if has_space(preferred) {
            return Some(preferred);
        }

        let max_probes = self.cfg.safety.max_layer_probes.clamp(1, self.num_layers);
        let mut cur = self.ring_cursor.load(Ordering::Relaxed) % self.num_layers;
        for _ in 0..max_probes {
            if has_space(cur) {
                self.ring_cursor
                    .store((cur + 1) % self.num_layers, Ordering::Relaxed);
                return Some(cur);
            }
            cur = (cur + 1) % self.num_layers;
        }
        None
    }

    fn maybe_scavenge(&self) {
        let cfg = &self.cfg.scavenger;
        if !cfg.enabled || cfg.period_allocs == 0 {
            return;
        }
        let n = self.allocs_since_scavenge.fetch_add(1, Ordering::Relaxed) + 1;
        if n < cfg.period_allocs {
            return;
        }
        self.allocs_since_scavenge.store(0, Ordering::Relaxed);

        scavenger::run(&self.layers, cfg);
        tracing::debug!(period = cfg.period_allocs, "scavenger pass complete");
        self.emit(
            EventKind::Scavenge,
            self.current_data_layer.load(Ordering::Relaxed),
            self.current_mem_layer.load(Ordering::Relaxed),
            0,
            Some("scavenger run"),
        );
    }

    /// Attempt placement in one specific layer; emits MEM-TP and Alloc
    /// events on success.
    fn alloc_from_layer(&self, data_layer: u32, mem_layer: u32, size: usize) -> *mut u8 {
        if mem_layer >= self.num_layers {
            return ptr::null_mut();
        }
        let layer = &self.layers[mem_layer as usize];
        match layer.alloc(data_layer, mem_layer, size) {
            Some(placed) => {
                if placed.crossed_mem_tp {
                    self.emit(
                        EventKind::LayerMemTPReached,
                        data_layer,
                        mem_layer,
                        size,
                        Some("MEM-TP reached"),
                    );
                }
                self.emit(
                    EventKind::Alloc,
                    data_layer,
                    mem_layer,
                    size,
                    Some(if placed.from_free_list {
                        "free-list"
                    } else {
                        "bump"
                    }),
                );
                placed.user_ptr
            }
            None => ptr::null_mut(),
        }
    }

    /// Allocate `size` bytes (0 is coerced to 1). Returns null on
    /// exhaustion after spill probing and fallback; the pointer is aligned
    /// to at least 16 bytes.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.maybe_scavenge();
        let size = size.max(1);

        let mut dl = self.current_data_layer.load(Ordering::Relaxed);
        let mut ml = self.current_mem_layer.load(Ordering::Relaxed);
        if dl >= self.num_layers {
            dl = self.num_layers - 1;
        }
        if ml >= self.num_layers {
            ml = dl;
        }

        let current = &self.layers[ml as usize];
        let input = PolicyInput {
            num_layers: self.num_layers,
            data_layer: dl,
            mem_layer: ml,
            request_size: size,
            data_alloc_count: self.data_alloc_count_in_layer.load(Ordering::Relaxed),
            data_alloc_bytes: self.data_alloc_bytes_in_layer.load(Ordering::Relaxed),
            data_points: &self.cfg.data_layers[dl as usize],
            mem_tp_reached: current.mem_tp_reached(),
            mem_lp_full: current.is_full(),
            mem_used_bytes: current.used_bytes(),
            mem_capacity_bytes: current.capacity(),
            mem_tp_bytes: current.mem_tp(),
            prev_layers_incomplete: self.any_prev_layer_incomplete(dl),
            strict_jumps: self.cfg.strict_picas_jumps,
        };
        let mut decision = policy::decide(&input);

        if decision.reached_tlp {
            self.emit(EventKind::LayerTLPReached, dl, ml, size, Some("TLP reached"));
        }
        if decision.reached_data_lp {
            self.emit(
                EventKind::LayerDataLPReached,
                dl,
                ml,
                size,
                Some("DATA-LP reached"),
            );
        }

        // Invalid-configuration errors are local to the call: event, then
        // null, no fallback.
        if decision.hard_error {
            self.emit(EventKind::OutOfMemory, dl, ml, size, decision.note);
            return ptr::null_mut();
        }

        // Anti-stranding: cancel a jump that would waste too much of the
        // current layer, unless the layer is under pressure.
        if decision.jump_data_layer && self.cfg.safety.anti_stranding.enabled {
            let strand_bad = self.would_strand_too_much(ml);
            let pressured = current.is_full()
                || (current.capacity() != 0
                    && current.used_bytes() > current.capacity() * 9 / 10);

            if strand_bad && !(self.cfg.safety.anti_stranding.allow_jump_if_pressure && pressured) {
                decision.jump_data_layer = false;
                decision.jump_mem_layer = false;
                if self.cfg.safety.anti_stranding.aggressive_backfill {
                    decision.backfill_memory = true;
                }
                decision.note = Some("anti-stranding: delayed jump");
            }
        }

        // Apply the jump: advance the phase and reset its progress.
        if decision.jump_data_layer && dl + 1 < self.num_layers {
            self.emit(EventKind::JumpToNextLayer, dl, ml, size, decision.note);
            dl += 1;
            self.current_data_layer.store(dl, Ordering::Relaxed);
            self.data_alloc_count_in_layer.store(0, Ordering::Relaxed);
            self.data_alloc_bytes_in_layer.store(0, Ordering::Relaxed);
            if decision.jump_mem_layer {
                ml = dl.min(self.num_layers - 1);
                self.current_mem_layer.store(ml, Ordering::Relaxed);
            }
        }

        // Target selection: backfill beats the policy's choice.
        let mut chosen = if decision.backfill_memory {
            let earliest = self.find_earliest_incomplete(dl);
            self.emit(
                EventKind::DataAdvancedMemoryBackfill,
                dl,
                earliest,
                size,
                decision.note,
            );
            earliest
        } else {
            decision.chosen_mem_layer.min(self.num_layers - 1)
        };

        if self.layers[chosen as usize].is_full() {
            if let Some(probed) = self.choose_layer_bounded(dl) {
                chosen = probed;
                self.emit(
                    EventKind::MemorySpillToOtherLayer,
                    dl,
                    chosen,
                    size,
                    Some("bounded-probe spill"),
                );
            }
        }

        let mut placed = self.alloc_from_layer(dl, chosen, size);

        // One more probe from the layer that just failed.
        if placed.is_null() {
            if let Some(probed) = self.choose_layer_bounded(chosen) {
                chosen = probed;
                self.emit(
                    EventKind::MemorySpillToOtherLayer,
                    dl,
                    chosen,
                    size,
                    Some("bounded-probe retry"),
                );
                placed = self.alloc_from_layer(dl, chosen, size);
            }
        }

        if placed.is_null() {
            self.emit(
                EventKind::OutOfMemory,
                dl,
                chosen,
                size,
                Some("arena exhausted"),
            );
            if self.cfg.safety.always_fallback_on_fail {
                let fb = self.fallback.alloc(size);
                if !fb.is_null() {
                    self.emit(EventKind::FallbackAlloc, dl, chosen, size, Some("fallback"));
                    return fb;
                }
            }
            return ptr::null_mut();
        }

        self.data_alloc_count_in_layer.fetch_add(1, Ordering::Relaxed);
        self.data_alloc_bytes_in_layer
            .fetch_add(size, Ordering::Relaxed);

        if self.cfg.enable_tracing && self.tracer.enabled() {
            let layer = &self.layers[chosen as usize];
            let addr = placed as usize;
            self.tracer.record(TraceEntry {
                seq: self.alloc_seq.fetch_add(1, Ordering::Relaxed),
                data_layer: dl,
                mem_layer: chosen,
                size,
                addr,
                layer_offset: addr.saturating_sub(layer.begin()),
                penalty_cost: if chosen == dl { 0.0 } else { self.cfg.penalty_k },
                note: decision.note,
            });
        }

        placed
    }

    /// Release a pointer previously returned by this allocator. Null and
    /// pointers the allocator does not recognize are ignored.
    ///
    /// # Safety
    /// `p` must be null, or a live pointer from this instance, or point
    /// just past at least `ALIGN_TAG_SIZE` readable bytes (so the tag
    /// probe can inspect them). Double-freeing an arena pointer is
    /// undefined.
    pub unsafe fn free(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }

        // Over-aligned pointer: resolve the tag and free its base block.
        let tag = align_tag_before(p);
        if !tag.is_null() {
            self.free((*tag).base);
            return;
        }

        if fallback::owns(p) {
            self.fallback.free(p);
            self.emit(
                EventKind::Free,
                self.current_data_layer.load(Ordering::Relaxed),
                0,
                0,
                Some("free fallback"),
            );
            return;
        }

        let header = self.header_from_user_ptr(p);
        if header.is_null() {
            return;
        }
        self.free_block(header);
    }

    unsafe fn free_block(&self, header: *mut BlockHeader) {
        let mem_layer = (*header).mem_layer;
        if mem_layer >= self.num_layers {
            return;
        }
        let (data_layer, user_size) = self.layers[mem_layer as usize].free(header);
        self.emit(
            EventKind::Free,
            data_layer,
            mem_layer,
            user_size,
            Some("free"),
        );
    }

    /// Resize an allocation. `p == null` behaves as `malloc`; `size == 0`
    /// frees and returns null. Shrinking an arena block is in place;
    /// everything else is allocate-copy-free.
    ///
    /// # Safety
    /// Same contract as [`Picas::free`]; `p` must not be used after a
    /// successful move.
    pub unsafe fn realloc(&self, p: *mut u8, new_size: usize) -> *mut u8 {
        if p.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            self.free(p);
            return ptr::null_mut();
        }

        // Over-aligned blocks always move: the tag cannot be preserved in
        // place without re-deriving the base offset.
        let tag = align_tag_before(p);
        if !tag.is_null() {
            let old_size = (*tag).requested;
            let new_ptr = self.malloc(new_size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(p, new_ptr, old_size.min(new_size));
            self.free(p);
            self.emit(
                EventKind::Realloc,
                self.current_data_layer.load(Ordering::Relaxed),
                self.current_mem_layer.load(Ordering::Relaxed),
                new_size,
                Some("realloc aligned, copied"),
            );
            return new_ptr;
        }

        if fallback::owns(p) {
            let old_size = fallback::usable_size(p);
            let new_ptr = self.malloc(new_size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(p, new_ptr, old_size.min(new_size));
            self.fallback.free(p);
            self.emit(
                EventKind::Realloc,
                self.current_data_layer.load(Ordering::Relaxed),
                0,
                new_size,
                Some("realloc fallback to arena"),
            );
            return new_ptr;
        }

        let header = self.header_from_user_ptr(p);
        if header.is_null() {
            return ptr::null_mut();
        }

        if new_size <= (*header).user_size {
            (*header).user_size = new_size;
            self.emit(
                EventKind::Realloc,
                (*header).data_layer,
                (*header).mem_layer,
                new_size,
                Some("shrink in place"),
            );
            return p;
        }

        let old_size = (*header).user_size;
        let (data_layer, mem_layer) = ((*header).data_layer, (*header).mem_layer);
        let new_ptr = self.malloc(new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(p, new_ptr, old_size);
        self.free(p);
        self.emit(
            EventKind::Realloc,
            data_layer,
            mem_layer,
            new_size,
            Some("grow via copy"),
        );
        new_ptr
    }

    /// Aligned allocation. The alignment is raised to the pointer size and
    /// must be a power of two; alignments up to the natural 16 defer to
    /// [`Picas::malloc`]. The result of a later `realloc` is *not*
    /// guaranteed to keep the alignment.
    pub fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
        let size = size.max(1);
        let alignment = alignment.max(core::mem::size_of::<*mut u8>());
        if !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        if alignment <= MIN_ALIGN {
            return self.malloc(size);
        }

        // Over-allocate so both the aligned pointer and its tag land
        // inside the block: [base .. tag .. aligned user bytes].
        let Some(padded) = size.checked_add(alignment + ALIGN_TAG_SIZE) else {
            return ptr::null_mut();
        };
        let base = self.malloc(padded);
        if base.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: `padded` leaves room for the tag and `size` user bytes
        // at any alignment-rounded offset past `base + ALIGN_TAG_SIZE`.
        unsafe {
            let aligned = align_up(base as usize + ALIGN_TAG_SIZE, alignment) as *mut u8;
            debug_assert!(is_aligned(aligned as usize, alignment));
            let tag = aligned.sub(ALIGN_TAG_SIZE) as *mut AlignTag;
            tag.write(AlignTag {
                magic: ALIGN_MAGIC,
                base,
                requested: size,
            });
            self.emit(
                EventKind::Alloc,
                self.current_data_layer.load(Ordering::Relaxed),
                self.current_mem_layer.load(Ordering::Relaxed),
                size,
                Some("memalign"),
            );
            aligned
        }
    }

    /// Allocate a zeroed buffer of `n * size` bytes; null on overflow.
    pub fn calloc(&self, n: usize, size: usize) -> *mut u8 {
        if n == 0 || size == 0 {
            return self.malloc(1);
        }
        let Some(total) = n.checked_mul(size) else {
            return ptr::null_mut();
        };
        let p = self.malloc(total);
        if !p.is_null() {
            // SAFETY: a non-null malloc result is writable for `total`.
            unsafe { ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// User-requested size of an allocation from this instance, 0 for
    /// anything unrecognized.
    ///
    /// # Safety
    /// Same readability contract as [`Picas::free`].
    pub unsafe fn usable_size(&self, p: *mut u8) -> usize {
        if p.is_null() {
            return 0;
        }

        if (p as usize) >= ALIGN_TAG_SIZE {
            let tag = p.sub(ALIGN_TAG_SIZE) as *const AlignTag;
            if (*tag).magic == ALIGN_MAGIC {
                return (*tag).requested;
            }
        }

        if fallback::owns(p) {
            return fallback::usable_size(p);
        }

        let header = self.header_from_user_ptr(p);
        if header.is_null() {
            return 0;
        }
        (*header).user_size
    }

    /// Resolve a user pointer to its arena block header, testing the
    /// normal layout first and the align-tag layout second. Returns null
    /// for fallback blocks and foreign pointers.
    unsafe fn header_from_user_ptr(&self, p: *mut u8) -> *mut BlockHeader {
        if p.is_null() {
            return ptr::null_mut();
        }
        let addr = p as usize;

        if addr >= HEADER_SIZE {
            let header = (addr - HEADER_SIZE) as *mut BlockHeader;
            if self.ptr_in_arena(header as usize) && (*header).magic == BLOCK_MAGIC {
                return header;
            }
        }

        let tag = align_tag_before(p);
        if !tag.is_null() {
            let base = (*tag).base;
            // A fallback base has no arena header.
            if fallback::owns(base) {
                return ptr::null_mut();
            }
            let header = (base as usize).wrapping_sub(HEADER_SIZE) as *mut BlockHeader;
            if self.ptr_in_arena(header as usize) && (*header).magic == BLOCK_MAGIC {
                return header;
            }
        }

        ptr::null_mut()
    }
}

/// The align tag immediately before `p`, or null when the magic does not
/// match.
///
/// # Safety
/// `p` must point just past at least `ALIGN_TAG_SIZE` readable bytes.
unsafe fn align_tag_before(p: *mut u8) -> *mut AlignTag {
    if (p as usize) < ALIGN_TAG_SIZE {
        return ptr::null_mut();
    }
    let tag = p.sub(ALIGN_TAG_SIZE) as *mut AlignTag;
    if (*tag).magic == ALIGN_MAGIC && !(*tag).base.is_null() {
        tag
    } else {
        ptr::null_mut()
    }
}

impl Drop for Picas {
    fn drop(&mut self) {
        if !self.pages.is_null() {
            // SAFETY: the reservation came from `reserve_and_commit` in
            // `new`; dropping the instance invalidates every arena
            // pointer by contract.
            unsafe { platform::release(self.pages) };
        }
        tracing::debug!("picas arena released");
    }
}
