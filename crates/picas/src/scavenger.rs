//! Periodic free-list maintenance: address-sorted coalescing and
//! rebucketing, one layer at a time under that layer's lock.

use crate::config::ScavengerConfig;
use crate::layer::{bin_index, FreeNode, Layer, NUM_BINS};
use core::ptr;

pub(crate) fn run(layers: &[Layer], cfg: &ScavengerConfig) {
    if !cfg.enabled {
        return;
    }

    for layer in layers {
        layer.with_bins(|heads| {
            // Detach every node from every bin into a flat scratch list.
            let mut blocks: Vec<*mut FreeNode> = Vec::with_capacity(256);
            for head in heads.iter_mut() {
                let mut cur = *head;
                while !cur.is_null() {
                    blocks.push(cur);
                    // SAFETY: bin nodes are valid free regions in this
                    // layer; we hold the layer lock.
                    cur = unsafe { (*cur).next };
                }
                *head = ptr::null_mut();
            }
            if blocks.is_empty() {
                return;
            }

            blocks.sort_unstable_by_key(|&node| node as usize);

            if cfg.enable_coalescing {
                // Merge every pair where one region ends exactly where the
                // next begins.
                let mut merged: Vec<*mut FreeNode> = Vec::with_capacity(blocks.len());
                let mut cur = blocks[0];
                for &next in &blocks[1..] {
                    // SAFETY: both nodes are detached free regions owned by
                    // this layer; growing `cur` only ever absorbs `next`.
                    unsafe {
                        if (cur as usize) + (*cur).size == next as usize {
                            (*cur).size += (*next).size;
                        } else {
                            merged.push(cur);
                            cur = next;
                        }
                    }
                }
                merged.push(cur);
                blocks = merged;
            }

            if cfg.enable_rebucket {
                for &node in &blocks {
                    // SAFETY: as above; reinsertion at the head of the bin
                    // for the (possibly grown) size.
                    unsafe {
                        let bin = bin_index((*node).size);
                        (*node).next = heads[bin];
                        heads[bin] = node;
                    }
                }
            } else {
                // Without rebucketing everything lands in the largest bin.
                let top = NUM_BINS - 1;
                for &node in &blocks {
                    // SAFETY: as above.
                    unsafe {
                        (*node).next = heads[top];
                        heads[top] = node;
                    }
                }
            }
        });
    }
}
