//! Per-layer state: bump cursor plus size-binned free lists.
//!
//! A freed block is reinterpreted in place as a [`FreeNode`]; the node
//! overlays the first bytes of the [`BlockHeader`], clobbering the magic.
//! Both layouts are written and read through raw pointers only, never
//! through a union, and every header field that is needed later is read
//! before the node overwrite.

use crate::util::{align_up, MIN_ALIGN};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::Mutex;

/// Magic stamped into live arena block headers ("PICA").
pub const BLOCK_MAGIC: u32 = 0x5049_4341;

/// Number of free-list bins per layer.
pub const NUM_BINS: usize = 20;

/// Header placed immediately before every arena user pointer.
#[repr(C)]
pub struct BlockHeader {
    pub magic: u32,
    pub mem_layer: u32,
    pub data_layer: u32,
    pub flags: u32,
    /// Size requested by the user.
    pub user_size: usize,
    /// Total block size including header and padding; always a multiple
    /// of 16.
    pub total_size: usize,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Free-list node written in place over a freed block's header.
#[repr(C)]
pub struct FreeNode {
    pub next: *mut FreeNode,
    /// Size of the contiguous region this node occupies (the block's
    /// former `total_size`, possibly grown by coalescing).
    pub size: usize,
}

/// Total footprint of a block serving `user_size` bytes.
#[inline]
pub const fn block_total(user_size: usize) -> usize {
    align_up(HEADER_SIZE + user_size, MIN_ALIGN)
}

/// Smallest block the allocator ever carves. A layer without room for this
/// is full for both the policy and the bounded probe.
pub const MIN_BLOCK_TOTAL: usize = block_total(1);

/// Smallest split remainder worth keeping as its own free node.
pub(crate) const MIN_SPLIT_TOTAL: usize = block_total(32);

/// Free-list bin for a block size: `floor(log2(max(size, 32)))`, clamped.
/// Bins hold blocks of their size class *or larger* (splits may leave
/// oversized nodes in low bins until the scavenger rebuckets them).
#[inline]
pub fn bin_index(size: usize) -> usize {
    let v = size.max(32);
    let idx = (usize::BITS - 1 - v.leading_zeros()) as usize;
    idx.min(NUM_BINS - 1)
}

/// Bin heads. Guarded by the layer mutex together with the bump cursor.
struct Bins {
    heads: [*mut FreeNode; NUM_BINS],
}

// Raw free-list pointers only ever travel with the layer they belong to.
unsafe impl Send for Bins {}

/// Outcome of a successful in-layer allocation.
pub(crate) struct LayerAlloc {
    pub user_ptr: *mut u8,
    pub from_free_list: bool,
    /// This allocation was the first to push `bump_used` past MEM-TP.
    pub crossed_mem_tp: bool,
}

/// One memory layer: a fixed `[begin, end)` slice of the arena, a
/// monotonic bump cursor, and `NUM_BINS` free-list bins.
///
/// The mutex guards the bins and all bump/accounting mutation; the atomic
/// mirrors allow lock-free advisory reads (fullness probes, stats). Those
/// reads are observational only; the allocation path re-checks under the
/// lock.
pub struct Layer {
    begin: usize,
    end: usize,
    capacity: usize,
    mem_tp: usize,

    bump: AtomicUsize,
    bump_used: AtomicUsize,
    live_est: AtomicUsize,
    mem_tp_reached: AtomicBool,

    bins: Mutex<Bins>,
}

impl Layer {
    /// # Safety
    /// `[begin, begin + capacity)` must be a writable mapping disjoint from
    /// every other layer, and must outlive the layer.
    pub(crate) unsafe fn new(begin: usize, capacity: usize, mem_tp: usize) -> Self {
        Layer {
            begin,
            end: begin + capacity,
            capacity,
            mem_tp,
            bump: AtomicUsize::new(begin),
            bump_used: AtomicUsize::new(0),
            live_est: AtomicUsize::new(0),
            // An unconfigured MEM-TP counts as already reached so it can
            // never hold up a strict jump.
            mem_tp_reached: AtomicBool::new(mem_tp == 0),
            bins: Mutex::new(Bins {
                heads: [ptr::null_mut(); NUM_BINS],
            }),
        }
    }

    pub(crate) fn begin(&self) -> usize {
        self.begin
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn mem_tp(&self) -> usize {
        self.mem_tp
    }

    pub(crate) fn mem_tp_reached(&self) -> bool {
        self.mem_tp_reached.load(Ordering::Relaxed)
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.bump_used.load(Ordering::Relaxed)
    }

    pub(crate) fn live_bytes_est(&self) -> usize {
        self.live_est.load(Ordering::Relaxed)
    }

    /// Bytes between the bump cursor and the end of the layer; what a jump
    /// away from this layer would strand.
    pub(crate) fn remaining_bytes(&self) -> usize {
        self.end.saturating_sub(self.bump.load(Ordering::Relaxed))
    }

    /// Advisory: room left for `need` more bump bytes.
    pub(crate) fn has_room(&self, need: usize) -> bool {
        self.bump.load(Ordering::Relaxed) + need <= self.end
    }

    /// A layer that cannot fit even a minimum block is full. The same
    /// predicate feeds the policy input and the bounded probe.
    pub(crate) fn is_full(&self) -> bool {
        !self.has_room(MIN_BLOCK_TOTAL)
    }

    /// Allocate `user_size` bytes in this layer, or `None` when neither the
    /// free lists nor the bump region can fit the block.
    pub(crate) fn alloc(
        &self,
        data_layer: u32,
        mem_layer: u32,
        user_size: usize,
    ) -> Option<LayerAlloc> {
        if user_size > usize::MAX - (HEADER_SIZE + MIN_ALIGN) {
            return None;
        }
        let total = block_total(user_size);

        let mut bins = self.bins.lock();

        // Free-list search: bins ascending from the size class, first fit
        // within each bin.
        let first = bin_index(total);
        for b in first..NUM_BINS {
            let mut prev: *mut FreeNode = ptr::null_mut();
            let mut cur = bins.heads[b];
            while !cur.is_null() {
                // SAFETY: bin nodes always point at free regions inside
                // this layer, guarded by the layer mutex.
                unsafe {
                    if (*cur).size >= total {
                        let next = (*cur).next;
                        if prev.is_null() {
                            bins.heads[b] = next;
                        } else {
                            (*prev).next = next;
                        }

                        let mut assigned = (*cur).size;
                        let remainder = assigned - total;
                        if remainder >= MIN_SPLIT_TOTAL {
                            let split = (cur as *mut u8).add(total) as *mut FreeNode;
                            let split_bin = bin_index(remainder);
                            (*split).next = bins.heads[split_bin];
                            (*split).size = remainder;
                            bins.heads[split_bin] = split;
                            assigned = total;
                        }

                        let header = cur as *mut BlockHeader;
                        stamp_header(header, mem_layer, data_layer, user_size, assigned);

                        let est = self.live_est.load(Ordering::Relaxed);
                        self.live_est.store(est + assigned, Ordering::Relaxed);

                        return Some(LayerAlloc {
                            user_ptr: (header as *mut u8).add(HEADER_SIZE),
                            from_free_list: true,
                            crossed_mem_tp: false,
                        });
                    }
                    prev = cur;
                    cur = (*cur).next;
                }
            }
        }

        // Bump path. Compare against the remaining span so an oversized
        // `total` cannot wrap the address arithmetic.
        let bump = self.bump.load(Ordering::Relaxed);
        if total > self.end - bump {
            return None;
        }
        self.bump.store(bump + total, Ordering::Relaxed);
        let used = self.bump_used.load(Ordering::Relaxed) + total;
        self.bump_used.store(used, Ordering::Relaxed);
        let est = self.live_est.load(Ordering::Relaxed);
        self.live_est.store(est + total, Ordering::Relaxed);

        let header = bump as *mut BlockHeader;
        // SAFETY: [bump, bump + total) lies inside this layer's mapping
        // and no live block or free node overlaps it.
        let user_ptr = unsafe {
            stamp_header(header, mem_layer, data_layer, user_size, total);
            (header as *mut u8).add(HEADER_SIZE)
        };

        let crossed =
            self.mem_tp > 0 && used >= self.mem_tp && !self.mem_tp_reached.load(Ordering::Relaxed);
        if crossed {
            self.mem_tp_reached.store(true, Ordering::Relaxed);
        }

        Some(LayerAlloc {
            user_ptr,
            from_free_list: false,
            crossed_mem_tp: crossed,
        })
    }

    /// Reinterpret a live block as a free node and push it onto its bin.
    /// Returns the block's `(data_layer, user_size)` for event reporting.
    ///
    /// # Safety
    /// `header` must point at a live, magic-verified block owned by this
    /// layer, and no other reference to the block may remain in use.
    pub(crate) unsafe fn free(&self, header: *mut BlockHeader) -> (u32, usize) {
        // Read everything before the node overwrite clobbers the header.
        let data_layer = (*header).data_layer;
        let user_size = (*header).user_size;
        let total = (*header).total_size;

        let mut bins = self.bins.lock();

        let node = header as *mut FreeNode;
        let bin = bin_index(total);
        (*node).next = bins.heads[bin];
        (*node).size = total;
        bins.heads[bin] = node;

        // The live estimate is non-authoritative; saturate at zero.
        let est = self.live_est.load(Ordering::Relaxed);
        self.live_est.store(est.saturating_sub(total), Ordering::Relaxed);

        drop(bins);
        (data_layer, user_size)
    }

    /// Run `f` over the bin heads while holding the layer lock. Used by the
    /// scavenger so its whole pass on a layer is one critical section.
    pub(crate) fn with_bins<R>(&self, f: impl FnOnce(&mut [*mut FreeNode; NUM_BINS]) -> R) -> R {
        let mut bins = self.bins.lock();
        f(&mut bins.heads)
    }
}

/// Stamp a live block header.
///
/// # Safety
/// `header` must point at `HEADER_SIZE` writable bytes.
#[inline]
unsafe fn stamp_header(
    header: *mut BlockHeader,
    mem_layer: u32,
    data_layer: u32,
    user_size: usize,
    total_size: usize,
) {
    header.write(BlockHeader {
        magic: BLOCK_MAGIC,
        mem_layer,
        data_layer,
        flags: 0,
        user_size,
        total_size,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_sixteen_byte_granular() {
        assert_eq!(HEADER_SIZE % 16, 0);
        for user in [1usize, 15, 16, 17, 31, 32, 100, 4096] {
            assert_eq!(block_total(user) % 16, 0);
            assert!(block_total(user) >= HEADER_SIZE + user);
        }
    }

    #[test]
    fn free_node_overlays_header_prefix() {
        assert!(core::mem::size_of::<FreeNode>() <= HEADER_SIZE);
    }

    #[test]
    fn bin_index_is_log2_clamped() {
        assert_eq!(bin_index(0), 5);
        assert_eq!(bin_index(31), 5);
        assert_eq!(bin_index(32), 5);
        assert_eq!(bin_index(63), 5);
        assert_eq!(bin_index(64), 6);
        assert_eq!(bin_index(1024), 10);
        assert_eq!(bin_index(usize::MAX), NUM_BINS - 1);
    }

    #[test]
    fn min_block_covers_smallest_request() {
        assert_eq!(MIN_BLOCK_TOTAL, block_total(1));
        assert!(MIN_SPLIT_TOTAL >= MIN_BLOCK_TOTAL);
    }
}
