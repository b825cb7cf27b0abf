//! Aligned allocation: tag placement, identification, realloc movement.

use picas::config::{Config, LayerConfig};
use picas::Picas;
use std::ptr;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.num_layers = 3;
    for layer in &mut cfg.mem_layers[..3] {
        *layer = LayerConfig {
            bytes: 8 * 1024 * 1024,
            mem_tp_bytes: 0,
        };
    }
    cfg.enable_event_hooks = false;
    cfg.enable_tracing = false;
    cfg.scavenger.enabled = false;
    cfg
}

fn is_aligned(p: *mut u8, align: usize) -> bool {
    (p as usize) & (align - 1) == 0
}

#[test]
fn memalign_grid_of_alignments_and_sizes() {
    let a = Picas::new(test_config()).expect("arena reservation failed");

    for &align in &[16usize, 32, 64, 128, 256, 4096] {
        for i in 0..500 {
            let size = (i % 257) + 1;
            let p = a.memalign(align, size);
            assert!(!p.is_null(), "memalign({align}, {size}) returned NULL");
            assert!(is_aligned(p, align), "pointer not {align}-aligned");

            unsafe {
                ptr::write_bytes(p, 0xAB, size);
                let slice = std::slice::from_raw_parts(p, size);
                assert!(slice.iter().all(|&b| b == 0xAB));
                assert_eq!(a.usable_size(p), size);
                a.free(p);
            }
        }
    }
}

#[test]
fn memalign_small_alignment_defers_to_malloc() {
    let a = Picas::new(test_config()).expect("arena reservation failed");
    // <= natural alignment: ordinary block, identified by its header.
    for &align in &[1usize, 2, 8, 16] {
        let p = a.memalign(align, 100);
        assert!(!p.is_null());
        assert!(is_aligned(p, 16));
        unsafe {
            assert_eq!(a.usable_size(p), 100);
            a.free(p);
        }
    }
}

#[test]
fn memalign_rejects_non_power_of_two() {
    let a = Picas::new(test_config()).expect("arena reservation failed");
    // Alignments below the pointer size are coerced up, so use one above.
    assert!(a.memalign(24, 100).is_null());
    assert!(a.memalign(3000, 100).is_null());
}

#[test]
fn memalign_zero_size_is_coerced() {
    let a = Picas::new(test_config()).expect("arena reservation failed");
    let p = a.memalign(64, 0);
    assert!(!p.is_null());
    assert!(is_aligned(p, 64));
    unsafe {
        assert_eq!(a.usable_size(p), 1);
        a.free(p);
    }
}

#[test]
fn page_aligned_block_reallocs_with_contents() {
    let a = Picas::new(test_config()).expect("arena reservation failed");

    let p = a.memalign(4096, 100);
    assert!(!p.is_null());
    assert!(is_aligned(p, 4096));
    unsafe {
        assert_eq!(a.usable_size(p), 100);
        for i in 0..100usize {
            p.add(i).write((i & 0xFF) as u8);
        }

        // Aligned blocks always move on realloc; the contract only makes
        // the original memalign result aligned.
        let q = a.realloc(p, 200);
        assert!(!q.is_null());
        assert_ne!(q, p);
        assert_eq!(a.usable_size(q), 200);
        for i in 0..100usize {
            assert_eq!(q.add(i).read(), (i & 0xFF) as u8, "corrupt byte {i}");
        }
        a.free(q);
    }
}

#[test]
fn aligned_free_releases_the_base_block() {
    let a = Picas::new(test_config()).expect("arena reservation failed");

    // Re-allocating aligned blocks forever only works when each free
    // returns the (much larger) base block to the bins.
    for _ in 0..20_000 {
        let p = a.memalign(256, 1024);
        assert!(!p.is_null());
        unsafe { a.free(p) };
    }
    let stats = a.stats();
    assert_eq!(
        stats.total_live_est, 0,
        "aligned frees leaked base blocks into the live estimate"
    );
}

#[test]
fn memalign_shrinking_realloc_still_moves() {
    let a = Picas::new(test_config()).expect("arena reservation failed");
    let p = a.memalign(512, 300);
    assert!(!p.is_null());
    unsafe {
        for i in 0..300usize {
            p.add(i).write((i & 0xFF) as u8);
        }
        let q = a.realloc(p, 50);
        assert!(!q.is_null());
        assert_eq!(a.usable_size(q), 50);
        for i in 0..50usize {
            assert_eq!(q.add(i).read(), (i & 0xFF) as u8);
        }
        a.free(q);
    }
}
