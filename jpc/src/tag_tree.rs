//! Tag trees over an incrementally arriving bitstream.
//!
//! B.10.2 A tag tree is a way of representing a two-dimensional array of
//! non-negative integers in a hierarchical way. It successively creates
//! reduced resolution levels of this two-dimensional array, forming a tree.
//! At every node of this tree the minimum integer of the (up to four) nodes
//! below it is recorded. Level 0 is the lowest level of the tag tree; it
//! contains the top node.
//!
//! Packet headers query the tree repeatedly with growing thresholds as more
//! quality layers arrive, so every node keeps a monotonically nondecreasing
//! lower bound plus a final flag, and partial progress survives across
//! queries. Node state lives in transactional cells tied to the reader's
//! transaction, so an aborted packet parse un-reads the tree bits as well.

use crate::bitstream::{BitstreamReader, TransactionalCell};
use crate::CodestreamError;
use jpip::Databin;

#[derive(Debug, Clone, Copy)]
struct NodeState {
    /// Lower bound on the node's value. Values never decrease.
    minimal_possible_value: u16,
    is_final: bool,
}

struct TagTreeLevel {
    width: usize,
    nodes: Vec<TransactionalCell<NodeState>>,
}

/// A decoder for one tag tree; leaves form a `width` x `height` grid.
pub struct TagTree {
    /// Levels stored root first; the last level holds the leaves.
    levels: Vec<TagTreeLevel>,
    bits_read: TransactionalCell<bool>,
}

impl TagTree {
    /// Depth is `ceil(log2(max(width, height))) + 1`.
    pub fn new(width: usize, height: usize) -> Self {
        assert!(width > 0 && height > 0);
        let mut levels = Vec::new();
        let mut w = width;
        let mut h = height;
        loop {
            let nodes = (0..w * h)
                .map(|_| {
                    TransactionalCell::new(NodeState {
                        minimal_possible_value: 0,
                        is_final: false,
                    })
                })
                .collect();
            levels.push(TagTreeLevel { width: w, nodes });
            if w == 1 && h == 1 {
                break;
            }
            w = div_ceil(w, 2);
            h = div_ceil(h, 2);
        }
        levels.reverse();
        TagTree {
            levels,
            bits_read: TransactionalCell::new(false),
        }
    }

    /// Seeds the root's lower bound before any bit has been consumed; a
    /// no-op once bits were read.
    pub fn set_minimal_value_if_not_read_bits(&mut self, value: u16) {
        if self.bits_read.get() {
            return;
        }
        let root = &mut self.levels[0].nodes[0];
        let mut state = root.get();
        if state.minimal_possible_value < value {
            state.minimal_possible_value = value;
            root.set_committed(state);
        }
    }

    /// Whether the leaf at `(x, y)` holds a value no greater than
    /// `threshold`, consuming exactly the bits needed to decide.
    ///
    /// Fails with `InsufficientData` when the deciding bit has not arrived;
    /// the surrounding transaction abort un-reads everything consumed here.
    pub fn is_value_less_or_equal(
        &mut self,
        x: usize,
        y: usize,
        threshold: u16,
        reader: &mut BitstreamReader,
        databin: &Databin,
    ) -> Result<bool, CodestreamError> {
        let transaction = reader.transaction()?;
        let leaf_depth = self.levels.len() - 1;
        let mut inherited = 0;
        for depth in 0..self.levels.len() {
            let shift = leaf_depth - depth;
            let level = &mut self.levels[depth];
            let node = &mut level.nodes[(y >> shift) * level.width + (x >> shift)];
            let mut state = node.get();
            if state.minimal_possible_value < inherited {
                state.minimal_possible_value = inherited;
            }
            while !state.is_final && state.minimal_possible_value <= threshold {
                self.bits_read.set(&transaction, true);
                if reader.shift_bit(databin)? == 1 {
                    state.is_final = true;
                } else {
                    state.minimal_possible_value += 1;
                }
            }
            // Reborrow: reading bits released the node borrow.
            let level = &mut self.levels[depth];
            let node = &mut level.nodes[(y >> shift) * level.width + (x >> shift)];
            node.set(&transaction, state);
            if state.minimal_possible_value > threshold {
                return Ok(false);
            }
            inherited = state.minimal_possible_value;
        }
        Ok(true)
    }

    /// Fully resolves the leaf at `(x, y)` and returns its value.
    pub fn get_value(
        &mut self,
        x: usize,
        y: usize,
        reader: &mut BitstreamReader,
        databin: &Databin,
    ) -> Result<u16, CodestreamError> {
        let transaction = reader.transaction()?;
        let leaf_depth = self.levels.len() - 1;
        let mut inherited = 0;
        for depth in 0..self.levels.len() {
            let shift = leaf_depth - depth;
            let level = &mut self.levels[depth];
            let node = &mut level.nodes[(y >> shift) * level.width + (x >> shift)];
            let mut state = node.get();
            if state.minimal_possible_value < inherited {
                state.minimal_possible_value = inherited;
            }
            while !state.is_final {
                self.bits_read.set(&transaction, true);
                if reader.shift_bit(databin)? == 1 {
                    state.is_final = true;
                } else {
                    state.minimal_possible_value += 1;
                }
            }
            let level = &mut self.levels[depth];
            let node = &mut level.nodes[(y >> shift) * level.width + (x >> shift)];
            node.set(&transaction, state);
            inherited = state.minimal_possible_value;
        }
        Ok(inherited)
    }
}

fn div_ceil(value: usize, divisor: usize) -> usize {
    (value + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use jpip::DatabinClass;

    fn databin_with(bytes: &[u8]) -> Databin {
        let mut databin = Databin::new(DatabinClass::Precinct, 0);
        databin.save(0, bytes, true).unwrap();
        databin
    }

    #[test]
    fn test_depth_matches_leaf_grid() {
        assert_eq!(TagTree::new(1, 1).levels.len(), 1);
        assert_eq!(TagTree::new(2, 2).levels.len(), 2);
        assert_eq!(TagTree::new(6, 3).levels.len(), 4);
        assert_eq!(TagTree::new(16, 1).levels.len(), 5);
    }

    #[test]
    fn test_example_array_from_b_10_2() {
        // The 6x3 array of Figure B.12, leaves resolved in raster order.
        let bits = [0x79, 0xA6, 0xD5, 0x8B, 0x77, 0xD0];
        let databin = databin_with(&bits);
        let mut reader = BitstreamReader::new(0);
        let mut tree = TagTree::new(6, 3);

        let expected = [
            [1, 3, 2, 3, 2, 3],
            [2, 2, 1, 4, 3, 2],
            [2, 2, 2, 2, 1, 2],
        ];
        reader.start_transaction().unwrap();
        for (y, row) in expected.iter().enumerate() {
            for (x, value) in row.iter().enumerate() {
                assert_eq!(
                    tree.get_value(x, y, &mut reader, &databin).unwrap(),
                    *value,
                    "leaf ({}, {})",
                    x,
                    y
                );
            }
        }
        reader.commit().unwrap();
    }

    #[test]
    fn test_threshold_query_resumes_with_larger_threshold() {
        // Single leaf of value 1: encoded as "01".
        let databin = databin_with(&[0b0100_0000]);
        let mut reader = BitstreamReader::new(0);
        let mut tree = TagTree::new(1, 1);

        reader.start_transaction().unwrap();
        assert!(!tree
            .is_value_less_or_equal(0, 0, 0, &mut reader, &databin)
            .unwrap());
        reader.commit().unwrap();

        // The earlier query consumed one bit; this one resumes from there.
        reader.start_transaction().unwrap();
        assert!(tree
            .is_value_less_or_equal(0, 0, 1, &mut reader, &databin)
            .unwrap());
        reader.commit().unwrap();
    }

    #[test]
    fn test_aborted_query_consumes_nothing_durable() {
        let databin = databin_with(&[0b0100_0000]);
        let mut reader = BitstreamReader::new(0);
        let mut tree = TagTree::new(1, 1);

        reader.start_transaction().unwrap();
        assert!(!tree
            .is_value_less_or_equal(0, 0, 0, &mut reader, &databin)
            .unwrap());
        reader.abort().unwrap();

        // After the abort the same bits decode again from scratch.
        reader.start_transaction().unwrap();
        assert_eq!(tree.get_value(0, 0, &mut reader, &databin).unwrap(), 1);
        assert_eq!(reader.position().byte_offset, 0);
        reader.commit().unwrap();
    }

    #[test]
    fn test_seeded_minimum_skips_low_bits() {
        // Leaf value 3 with the root seeded at 2: only "01" is coded.
        let databin = databin_with(&[0b0100_0000]);
        let mut reader = BitstreamReader::new(0);
        let mut tree = TagTree::new(1, 1);
        tree.set_minimal_value_if_not_read_bits(2);

        reader.start_transaction().unwrap();
        assert_eq!(tree.get_value(0, 0, &mut reader, &databin).unwrap(), 3);
        reader.commit().unwrap();
    }

    #[test]
    fn test_insufficient_bits_surface_as_insufficient_data() {
        let mut databin = Databin::new(DatabinClass::Precinct, 0);
        databin.save(0, &[0x00], false).unwrap();
        let mut reader = BitstreamReader::new(0);
        let mut tree = TagTree::new(1, 1);

        reader.start_transaction().unwrap();
        let err = tree
            .get_value(0, 0, &mut reader, &databin)
            .unwrap_err();
        assert!(err.is_insufficient_data());
        reader.abort().unwrap();
    }
}
