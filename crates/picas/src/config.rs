//! Allocator configuration and its sanitization.

use crate::checkpoints::DataLayerPoints;
use thiserror::Error;

/// Upper bound on the number of memory layers.
pub const MAX_LAYERS: usize = 8;

/// Capacity and MEM-TP threshold for one memory layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerConfig {
    /// Capacity of this memory layer in bytes.
    pub bytes: usize,
    /// Memory transitory point inside that layer (0 = unconfigured).
    pub mem_tp_bytes: usize,
}

/// Which secondary allocator backs the arena when it cannot satisfy a
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    None,
    #[default]
    SystemMalloc,
    EmergencyReserve,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub mode: FallbackMode,
    /// Size of the reserve when mode is `EmergencyReserve`.
    pub emergency_bytes: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            mode: FallbackMode::SystemMalloc,
            emergency_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Guard against jumping away from a layer while it still holds a large
/// unreachable remainder.
#[derive(Debug, Clone, Copy)]
pub struct AntiStrandingConfig {
    pub enabled: bool,
    /// A jump that would strand more than this many bytes is delayed.
    pub max_stranded_per_layer: usize,
    /// Permit the jump anyway when the current layer is under pressure.
    pub allow_jump_if_pressure: bool,
    /// When a jump is delayed, bias toward backfilling earlier layers.
    pub aggressive_backfill: bool,
}

impl Default for AntiStrandingConfig {
    fn default() -> Self {
        AntiStrandingConfig {
            enabled: true,
            max_stranded_per_layer: 256 * 1024,
            allow_jump_if_pressure: true,
            aggressive_backfill: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyConfig {
    pub fallback: FallbackConfig,
    pub anti_stranding: AntiStrandingConfig,
    /// Hard cap on cross-layer probes per request (real-time guardrail).
    pub max_layer_probes: u32,
    /// Attempt the fallback allocator before returning null.
    pub always_fallback_on_fail: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            fallback: FallbackConfig::default(),
            anti_stranding: AntiStrandingConfig::default(),
            max_layer_probes: 8,
            always_fallback_on_fail: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScavengerConfig {
    pub enabled: bool,
    /// Run a maintenance pass every N successful allocations (0 disables).
    pub period_allocs: u64,
    /// Merge address-adjacent free blocks during the pass.
    pub enable_coalescing: bool,
    /// Reinsert survivors into their size bins; otherwise they are dumped
    /// into the largest bin.
    pub enable_rebucket: bool,
    /// Reserved: returning pages to the OS needs page accounting the
    /// allocator does not keep. Never consulted.
    pub enable_os_release: bool,
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        ScavengerConfig {
            enabled: true,
            period_allocs: 4096,
            enable_coalescing: true,
            enable_rebucket: true,
            enable_os_release: false,
        }
    }
}

/// Full allocator configuration. `Default` gives a three-layer setup with
/// strict jumps, tracing, and a system-malloc fallback.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Number of memory layers, clamped to `[1, MAX_LAYERS]`.
    pub num_layers: u32,

    /// Penalty recorded in the trace when an allocation lands in a memory
    /// layer other than its data layer. Purely observational.
    pub penalty_k: f64,

    pub mem_layers: [LayerConfig; MAX_LAYERS],
    pub data_layers: [DataLayerPoints; MAX_LAYERS],

    /// Enforce TLP-before-MEM-TP advancement and keep the memory layer
    /// aligned with the data layer on jumps.
    pub strict_picas_jumps: bool,

    pub enable_event_hooks: bool,
    pub enable_debug_pause: bool,
    pub debug_pause_ms: u32,

    pub safety: SafetyConfig,
    pub scavenger: ScavengerConfig,

    pub enable_tracing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_layers: 3,
            penalty_k: 1.0,
            mem_layers: [LayerConfig::default(); MAX_LAYERS],
            data_layers: [DataLayerPoints::default(); MAX_LAYERS],
            strict_picas_jumps: true,
            enable_event_hooks: true,
            enable_debug_pause: false,
            debug_pause_ms: 0,
            safety: SafetyConfig::default(),
            scavenger: ScavengerConfig::default(),
            enable_tracing: true,
        }
    }
}

impl Config {
    /// Clamp out-of-range settings into something the allocator can run
    /// with. Called once at construction; never fails.
    pub(crate) fn sanitize(&mut self) {
        self.num_layers = self.num_layers.clamp(1, MAX_LAYERS as u32);

        self.safety.max_layer_probes = self.safety.max_layer_probes.clamp(1, self.num_layers);

        if self.safety.fallback.mode == FallbackMode::EmergencyReserve
            && self.safety.fallback.emergency_bytes < 4096
        {
            self.safety.fallback.emergency_bytes = 4096;
        }

        if self.scavenger.enabled && self.scavenger.period_allocs == 0 {
            self.scavenger.period_allocs = 4096;
        }

        // An all-zero layer table gets a minimal 8 MiB arena split evenly,
        // with MEM-TP at three quarters of each layer.
        let layers = self.num_layers as usize;
        let total: usize = self.mem_layers[..layers].iter().map(|l| l.bytes).sum();
        if total == 0 {
            tracing::warn!(
                num_layers = self.num_layers,
                "no layer capacities configured; defaulting to an 8 MiB arena"
            );
            let per = 8 * 1024 * 1024 / layers;
            for layer in &mut self.mem_layers[..layers] {
                layer.bytes = per;
                layer.mem_tp_bytes = per * 3 / 4;
            }
        }

        for layer in &mut self.mem_layers[..layers] {
            if layer.mem_tp_bytes > layer.bytes {
                layer.mem_tp_bytes = layer.bytes;
            }
        }

        if self.safety.anti_stranding.enabled
            && self.safety.anti_stranding.max_stranded_per_layer < 1024
        {
            self.safety.anti_stranding.max_stranded_per_layer = 1024;
        }
    }
}

/// Construction-time failures. Allocation-time failures never surface as
/// errors; callers observe null pointers instead.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to reserve {bytes} bytes of arena pages")]
    ArenaReserveFailed { bytes: usize },

    #[error("failed to reserve {bytes} bytes for the emergency reserve")]
    EmergencyReserveFailed { bytes: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_layer_count() {
        let mut cfg = Config {
            num_layers: 0,
            ..Config::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.num_layers, 1);

        let mut cfg = Config {
            num_layers: 99,
            ..Config::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.num_layers, MAX_LAYERS as u32);
    }

    #[test]
    fn sanitize_bounds_probes_by_layer_count() {
        let mut cfg = Config {
            num_layers: 2,
            ..Config::default()
        };
        cfg.safety.max_layer_probes = 0;
        cfg.sanitize();
        assert_eq!(cfg.safety.max_layer_probes, 1);

        let mut cfg = Config {
            num_layers: 2,
            ..Config::default()
        };
        cfg.safety.max_layer_probes = 16;
        cfg.sanitize();
        assert_eq!(cfg.safety.max_layer_probes, 2);
    }

    #[test]
    fn sanitize_defaults_empty_arena() {
        let mut cfg = Config {
            num_layers: 4,
            ..Config::default()
        };
        cfg.sanitize();
        let total: usize = cfg.mem_layers[..4].iter().map(|l| l.bytes).sum();
        assert_eq!(total, 8 * 1024 * 1024);
        for layer in &cfg.mem_layers[..4] {
            assert_eq!(layer.mem_tp_bytes, layer.bytes * 3 / 4);
        }

        // A layer count that does not divide the default arena evenly:
        // MEM-TP multiplies before dividing, so it rounds down only once.
        let mut cfg = Config {
            num_layers: 3,
            ..Config::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.mem_layers[0].bytes, 2_796_202);
        assert_eq!(cfg.mem_layers[0].mem_tp_bytes, 2_097_151);
    }

    #[test]
    fn sanitize_clamps_mem_tp_to_capacity() {
        let mut cfg = Config::default();
        cfg.mem_layers[0].bytes = 64 * 1024;
        cfg.mem_layers[0].mem_tp_bytes = 1024 * 1024;
        cfg.mem_layers[1].bytes = 64 * 1024;
        cfg.mem_layers[2].bytes = 64 * 1024;
        cfg.sanitize();
        assert_eq!(cfg.mem_layers[0].mem_tp_bytes, 64 * 1024);
    }

    #[test]
    fn sanitize_enforces_minimum_emergency_reserve() {
        let mut cfg = Config::default();
        cfg.safety.fallback.mode = FallbackMode::EmergencyReserve;
        cfg.safety.fallback.emergency_bytes = 16;
        cfg.sanitize();
        assert_eq!(cfg.safety.fallback.emergency_bytes, 4096);
    }

    #[test]
    fn sanitize_restores_scavenger_period() {
        let mut cfg = Config::default();
        cfg.scavenger.period_allocs = 0;
        cfg.sanitize();
        assert_eq!(cfg.scavenger.period_allocs, 4096);

        let mut cfg = Config::default();
        cfg.scavenger.enabled = false;
        cfg.scavenger.period_allocs = 0;
        cfg.sanitize();
        assert_eq!(cfg.scavenger.period_allocs, 0);
    }
}
