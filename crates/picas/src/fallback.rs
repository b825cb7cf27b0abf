//! Secondary allocator used when the arena cannot satisfy a request.
//!
//! All three modes stamp the same header in front of the user pointer, so
//! ownership detection is a single magic comparison regardless of where
//! the bytes came from.

use crate::config::{FallbackConfig, FallbackMode, InitError};
use crate::platform::{self, Pages};
use crate::util::{align_up, MIN_ALIGN};
use core::ptr;
use parking_lot::Mutex;

/// Magic stamped into fallback block headers ("FALL"). Distinct from the
/// arena block magic and the align-tag magic.
pub const FALLBACK_MAGIC: u32 = 0x4641_4C4C;

/// Header placed at the base of every fallback block. Padded to 32 bytes
/// so the user pointer keeps the allocator's natural 16-byte alignment.
#[repr(C)]
struct FallbackHeader {
    magic: u32,
    mode: u32,
    user_size: usize,
    /// Header + aligned payload; kept for debugging dumps.
    #[allow(dead_code)]
    total_size: usize,
    _pad: [u8; 8],
}

const FB_HEADER_SIZE: usize = core::mem::size_of::<FallbackHeader>();

struct EmergencyReserve {
    pages: Pages,
    /// Next free address inside the reserve. Bump-only; free is a no-op.
    bump: Mutex<usize>,
}

/// The fallback subsystem for one allocator instance.
pub(crate) struct Fallback {
    mode: FallbackMode,
    emergency: Option<EmergencyReserve>,
}

impl Fallback {
    pub(crate) fn new(cfg: &FallbackConfig) -> Result<Self, InitError> {
        let emergency = if cfg.mode == FallbackMode::EmergencyReserve {
            let bytes = align_up(
                cfg.emergency_bytes.max(platform::page_size()),
                platform::page_size(),
            );
            let pages = platform::reserve_and_commit(bytes)
                .ok_or(InitError::EmergencyReserveFailed { bytes })?;
            Some(EmergencyReserve {
                bump: Mutex::new(pages.base as usize),
                pages,
            })
        } else {
            None
        };

        Ok(Fallback {
            mode: cfg.mode,
            emergency,
        })
    }

    pub(crate) fn alloc(&self, size: usize) -> *mut u8 {
        let size = size.max(1);
        if size > usize::MAX - (FB_HEADER_SIZE + 2 * MIN_ALIGN) {
            return ptr::null_mut();
        }
        let payload = align_up(size, MIN_ALIGN);
        let total = align_up(FB_HEADER_SIZE + payload, MIN_ALIGN);

        match self.mode {
            FallbackMode::None => ptr::null_mut(),

            FallbackMode::SystemMalloc => {
                // One contiguous block from the host runtime allocator,
                // with our header at the base.
                let raw = unsafe { libc::malloc(total) } as *mut u8;
                if raw.is_null() {
                    return ptr::null_mut();
                }
                // SAFETY: raw points at `total` fresh writable bytes.
                unsafe {
                    stamp(raw, FallbackMode::SystemMalloc, size, total);
                    raw.add(FB_HEADER_SIZE)
                }
            }

            FallbackMode::EmergencyReserve => {
                let Some(reserve) = &self.emergency else {
                    return ptr::null_mut();
                };
                let end = reserve.pages.base as usize + reserve.pages.size;
                let mut bump = reserve.bump.lock();
                if *bump + total > end {
                    return ptr::null_mut();
                }
                let base = *bump as *mut u8;
                *bump += total;
                // SAFETY: the region was carved from the reserve under the
                // bump lock and never handed out twice.
                unsafe {
                    stamp(base, FallbackMode::EmergencyReserve, size, total);
                    base.add(FB_HEADER_SIZE)
                }
            }
        }
    }

    /// Release a fallback-owned pointer. The mode stored in the header,
    /// not the configured one, decides the path, so blocks survive a
    /// config mismatch.
    ///
    /// # Safety
    /// `user_ptr` must be fallback-owned ([`owns`] returned true) and not
    /// freed before.
    pub(crate) unsafe fn free(&self, user_ptr: *mut u8) {
        let header = header_from_user(user_ptr);
        if header.is_null() || (*header).magic != FALLBACK_MAGIC {
            return;
        }
        match (*header).mode {
            m if m == FallbackMode::SystemMalloc as u32 => {
                libc::free(header as *mut libc::c_void);
            }
            // EmergencyReserve is bump-only: freeing is a no-op.
            _ => {}
        }
    }
}

impl Drop for Fallback {
    fn drop(&mut self) {
        if let Some(reserve) = self.emergency.take() {
            // SAFETY: the reserve mapping was created in `new` and no
            // fallback pointer may outlive the allocator instance.
            unsafe { platform::release(reserve.pages) };
        }
    }
}

#[inline]
unsafe fn header_from_user(user_ptr: *mut u8) -> *mut FallbackHeader {
    if (user_ptr as usize) < FB_HEADER_SIZE {
        return ptr::null_mut();
    }
    user_ptr.sub(FB_HEADER_SIZE) as *mut FallbackHeader
}

#[inline]
unsafe fn stamp(base: *mut u8, mode: FallbackMode, user_size: usize, total_size: usize) {
    (base as *mut FallbackHeader).write(FallbackHeader {
        magic: FALLBACK_MAGIC,
        mode: mode as u32,
        user_size,
        total_size,
        _pad: [0; 8],
    });
}

/// True iff the bytes immediately preceding `user_ptr` carry a fallback
/// header. Works for every mode.
///
/// # Safety
/// `user_ptr` must be null or point just past at least `FB_HEADER_SIZE`
/// readable bytes (any pointer produced by this allocator qualifies).
pub unsafe fn owns(user_ptr: *mut u8) -> bool {
    if user_ptr.is_null() {
        return false;
    }
    let header = header_from_user(user_ptr);
    !header.is_null() && (*header).magic == FALLBACK_MAGIC
}

/// Stored user size for fallback-owned pointers, 0 otherwise.
///
/// # Safety
/// Same contract as [`owns`].
pub unsafe fn usable_size(user_ptr: *mut u8) -> usize {
    if user_ptr.is_null() {
        return 0;
    }
    let header = header_from_user(user_ptr);
    if header.is_null() || (*header).magic != FALLBACK_MAGIC {
        return 0;
    }
    (*header).user_size
}
