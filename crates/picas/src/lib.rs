//! PICAS: a phase-aware, layered arena allocator.
//!
//! One contiguous OS reservation is split into a fixed sequence of memory
//! layers. A current *data layer* tracks the active phase of the workload;
//! configurable checkpoints (TLP / DATA-LP) advance it, and the placement
//! policy prefers penalty-free same-layer allocation with spill, backfill,
//! and fallback paths when a layer fills up.

pub mod allocator;
pub mod api;
pub mod checkpoints;
pub mod config;
pub mod events;
pub mod fallback;
pub mod layer;
pub mod platform;
pub mod policy;
pub mod tracer;

mod halting;
mod scavenger;
mod util;

pub use allocator::{Picas, Stats};
pub use config::Config;
pub use events::{Event, EventHook, EventKind};
