//! Process-wide instance and the malloc-like free-function surface.
//!
//! The instance lives in a lazily filled cell behind a `RwLock`. `init`
//! creates it (a second `init` without an intervening `shutdown` is a
//! no-op), `shutdown` drops the process-wide handle; outstanding
//! [`instance`] handles keep the arena mapped until they are released.

use crate::allocator::Picas;
use crate::config::{Config, InitError};
use crate::events::EventHook;
use core::ptr;
use parking_lot::RwLock;
use std::sync::Arc;

static INSTANCE: RwLock<Option<Arc<Picas>>> = RwLock::new(None);

/// Construct the process-wide allocator. No-op when one already exists.
pub fn init(cfg: Config) -> Result<(), InitError> {
    let mut slot = INSTANCE.write();
    if slot.is_some() {
        return Ok(());
    }
    *slot = Some(Arc::new(Picas::new(cfg)?));
    Ok(())
}

/// Drop the process-wide allocator handle. Pointers obtained from it must
/// not be used afterwards.
pub fn shutdown() {
    let handle = INSTANCE.write().take();
    drop(handle);
}

/// Handle to the process-wide allocator, for observability (stats, tracer,
/// phase control). `None` before `init` or after `shutdown`.
pub fn instance() -> Option<Arc<Picas>> {
    INSTANCE.read().clone()
}

pub fn malloc(size: usize) -> *mut u8 {
    match instance() {
        Some(alloc) => alloc.malloc(size),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// Same contract as [`Picas::free`].
pub unsafe fn free(p: *mut u8) {
    if let Some(alloc) = instance() {
        alloc.free(p);
    }
}

/// # Safety
/// Same contract as [`Picas::realloc`].
pub unsafe fn realloc(p: *mut u8, size: usize) -> *mut u8 {
    match instance() {
        Some(alloc) => alloc.realloc(p, size),
        None => ptr::null_mut(),
    }
}

pub fn memalign(alignment: usize, size: usize) -> *mut u8 {
    match instance() {
        Some(alloc) => alloc.memalign(alignment, size),
        None => ptr::null_mut(),
    }
}

pub fn calloc(n: usize, size: usize) -> *mut u8 {
    match instance() {
        Some(alloc) => alloc.calloc(n, size),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// Same contract as [`Picas::usable_size`].
pub unsafe fn usable_size(p: *mut u8) -> usize {
    match instance() {
        Some(alloc) => alloc.usable_size(p),
        None => 0,
    }
}

pub fn set_event_hook(hook: EventHook) {
    if let Some(alloc) = instance() {
        alloc.set_event_hook(hook);
    }
}

pub fn set_data_layer(layer: u32) {
    if let Some(alloc) = instance() {
        alloc.set_data_layer(layer);
    }
}
