#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// A contiguous read-write reservation handed back by [`reserve_and_commit`].
#[derive(Debug, Clone, Copy)]
pub struct Pages {
    pub base: *mut u8,
    pub size: usize,
}

unsafe impl Send for Pages {}
unsafe impl Sync for Pages {}

impl Pages {
    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }
}

/// Reserve and commit a read-write anonymous mapping of at least `bytes`.
/// The returned size is `bytes` rounded up to a page boundary. Returns
/// `None` when the OS refuses the mapping.
pub fn reserve_and_commit(bytes: usize) -> Option<Pages> {
    let size = crate::util::align_up(bytes.max(1), page_size());
    // SAFETY: size is page-aligned and non-zero.
    let base = unsafe { sys::map_anonymous(size) };
    if base.is_null() {
        None
    } else {
        Some(Pages { base, size })
    }
}

/// Release a reservation obtained from [`reserve_and_commit`].
///
/// # Safety
/// `pages` must have been returned by [`reserve_and_commit`] and no live
/// pointer into the range may be dereferenced afterwards.
pub unsafe fn release(pages: Pages) {
    if pages.is_null() || pages.size == 0 {
        return;
    }
    sys::unmap(pages.base, pages.size);
}

/// System page size in bytes.
#[inline]
pub fn page_size() -> usize {
    sys::page_size()
}
