#![no_main]

use libfuzzer_sys::fuzz_target;
use picas::config::{Config, LayerConfig};
use picas::Picas;

/// Fuzz target that interprets a byte slice as a sequence of allocator
/// operations against a private instance.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc, 4=memalign,
///           5=set_data_layer)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers and their requested sizes.
const MAX_SLOTS: usize = 64;

fn fuzz_config() -> Config {
    let mut cfg = Config::default();
    cfg.num_layers = 3;
    for (i, layer) in cfg.mem_layers[..3].iter_mut().enumerate() {
        *layer = LayerConfig {
            bytes: 512 * 1024,
            mem_tp_bytes: if i == 0 { 0 } else { 256 * 1024 },
        };
    }
    cfg.data_layers[0].tlp.bytes = picas::checkpoints::Range::to(128 * 1024);
    cfg.data_layers[0].data_lp.bytes = picas::checkpoints::Range::to(256 * 1024);
    cfg.data_layers[1].data_lp.count = picas::checkpoints::Range::to(500);
    cfg.enable_event_hooks = false;
    cfg.enable_tracing = false;
    cfg.scavenger.period_allocs = 128;
    cfg
}

fuzz_target!(|data: &[u8]| {
    let a = match Picas::new(fuzz_config()) {
        Ok(a) => a,
        Err(_) => return,
    };

    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 6;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // malloc
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                }
                let ptr = a.malloc(size);
                slots[slot] = ptr;
                sizes[slot] = size.max(1);
                if !ptr.is_null() {
                    unsafe {
                        assert_eq!(a.usable_size(ptr), size.max(1));
                        std::ptr::write_bytes(ptr, 0xAA, sizes[slot].min(256));
                    }
                }
            }
            1 => {
                // free
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                }
            }
            2 => {
                // realloc
                if !slots[slot].is_null() {
                    let ptr = unsafe { a.realloc(slots[slot], size) };
                    if !ptr.is_null() {
                        slots[slot] = ptr;
                        sizes[slot] = size;
                    } else if size == 0 {
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                    // Null for a non-zero size leaves the original valid.
                } else {
                    let ptr = unsafe { a.realloc(std::ptr::null_mut(), size) };
                    slots[slot] = ptr;
                    sizes[slot] = size.max(1);
                }
            }
            3 => {
                // calloc
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                }
                let nmemb = (size >> 8).max(1);
                let elem_size = (size & 0xFF).max(1);
                let ptr = a.calloc(nmemb, elem_size);
                let total = nmemb * elem_size;
                slots[slot] = ptr;
                sizes[slot] = total;
                if !ptr.is_null() {
                    let check_len = total.min(256);
                    for j in 0..check_len {
                        assert_eq!(
                            unsafe { *ptr.add(j) },
                            0,
                            "calloc memory not zeroed at offset {}",
                            j
                        );
                    }
                }
            }
            4 => {
                // memalign: alignment from the slot byte, 16..=4096
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                }
                let align = 16usize << (data[i - 1] % 9);
                let ptr = a.memalign(align, size);
                slots[slot] = ptr;
                sizes[slot] = size.max(1);
                if !ptr.is_null() {
                    assert_eq!(ptr as usize % align, 0, "memalign broke alignment");
                    unsafe {
                        assert_eq!(a.usable_size(ptr), size.max(1));
                        std::ptr::write_bytes(ptr, 0xBB, sizes[slot].min(256));
                    }
                }
            }
            5 => {
                // phase control
                a.set_data_layer(u32::from(data[i - 1]));
                assert!(a.data_layer() < a.num_layers());
            }
            _ => unreachable!(),
        }
    }

    // Cleanup
    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { a.free(*slot) };
            *slot = std::ptr::null_mut();
        }
    }
});
