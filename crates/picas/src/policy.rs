//! Placement policy: a pure decision function.
//!
//! The facade snapshots allocator state into a [`PolicyInput`], and
//! [`decide`] maps it to a [`PolicyOutput`] without touching any state.
//! Rules are evaluated in order; the first match returns.

use crate::checkpoints::DataLayerPoints;

/// Snapshot of everything the policy is allowed to look at.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub num_layers: u32,
    pub data_layer: u32,
    pub mem_layer: u32,

    pub request_size: usize,

    /// Progress inside the current data layer.
    pub data_alloc_count: usize,
    pub data_alloc_bytes: usize,

    /// Checkpoints for the current data layer.
    pub data_points: &'a DataLayerPoints,

    /// Current memory layer status.
    pub mem_tp_reached: bool,
    pub mem_lp_full: bool,
    pub mem_used_bytes: usize,
    pub mem_capacity_bytes: usize,
    pub mem_tp_bytes: usize,

    /// Any earlier memory layer still has space.
    pub prev_layers_incomplete: bool,

    /// Strict-jump mode from the configuration.
    pub strict_jumps: bool,
}

/// The placement decision. The facade applies it; the policy never
/// mutates anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyOutput {
    pub chosen_mem_layer: u32,

    pub jump_data_layer: bool,
    pub jump_mem_layer: bool,
    pub backfill_memory: bool,

    /// Phase-boundary signals, for events and debugging.
    pub reached_tlp: bool,
    pub reached_data_lp: bool,

    /// Unsatisfiable constraint; the request must fail.
    pub hard_error: bool,
    pub note: Option<&'static str>,
}

pub fn decide(input: &PolicyInput<'_>) -> PolicyOutput {
    let mut out = PolicyOutput {
        chosen_mem_layer: input.mem_layer,
        ..PolicyOutput::default()
    };

    if input.num_layers == 0 {
        out.hard_error = true;
        out.note = Some("invalid: num_layers=0");
        return out;
    }

    // A byte-based TLP span wider than the whole memory layer asks for a
    // phase checkpoint the layer can never hold.
    let tlp_bytes_span = input.data_points.tlp.bytes_span();
    if tlp_bytes_span != 0
        && input.mem_capacity_bytes != 0
        && tlp_bytes_span > input.mem_capacity_bytes
    {
        out.hard_error = true;
        out.note = Some("TLP bytes length exceeds layer capacity");
        return out;
    }

    out.reached_tlp = input
        .data_points
        .tlp
        .reached(input.data_alloc_count, input.data_alloc_bytes);
    out.reached_data_lp = input
        .data_points
        .data_lp
        .reached(input.data_alloc_count, input.data_alloc_bytes);

    // Hard boundary: DATA-LP means the phase must advance. The triggering
    // allocation still lands in the layer being closed out.
    if out.reached_data_lp {
        out.jump_data_layer = true;
        if input.strict_jumps {
            out.jump_mem_layer = true;
        }
        out.chosen_mem_layer = if input.data_layer < input.num_layers {
            input.data_layer
        } else {
            0
        };
        out.note = Some("DATA-LP reached: hard advance");
        return out;
    }

    // TLP reached before MEM-TP in the same level: jump both.
    if input.strict_jumps && out.reached_tlp && !input.mem_tp_reached {
        out.jump_data_layer = true;
        out.jump_mem_layer = true;
        out.note = Some("TLP before MEM-TP: jump data+memory");
        return out;
    }

    // Data has advanced past an earlier memory layer that still has space.
    if input.strict_jumps && input.prev_layers_incomplete {
        out.backfill_memory = true;
        out.note = Some("earlier memory incomplete: backfill");
        return out;
    }

    // Current memory layer is full; the facade will bounded-probe.
    if input.mem_lp_full {
        out.note = Some("current layer full: spill");
        return out;
    }

    // Default: same-layer placement, penalty-free.
    out.chosen_mem_layer = input.data_layer;
    out.note = Some("same-layer");
    out
}
