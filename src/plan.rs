use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_BLOCK_COUNT;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub block_size: u64,
    pub block_count: usize,
}

impl fmt::Display for BlockPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}B", self.block_count, self.block_size)
    }
}

impl BlockPlan {
    /// Splits `file_length` into at most [`MAX_BLOCK_COUNT`] blocks of at least
    /// `min_block_size` bytes, or a single block when `single_block` is set.
    pub fn new(file_length: u64, min_block_size: u64, single_block: bool) -> Self {
        let min_block_size = min_block_size.max(1);

        let block_size = if single_block {
            file_length
        } else if file_length.div_ceil(min_block_size) <= MAX_BLOCK_COUNT {
            min_block_size
        } else {
            file_length / MAX_BLOCK_COUNT + 1
        }
        .max(1);

        Self {
            block_size,
            block_count: file_length.div_ceil(block_size).max(1) as usize,
        }
    }

    /// (offset, length) of block `index`. An empty file has one empty block.
    pub fn block_range(&self, index: usize, file_length: u64) -> (u64, usize) {
        let offset = (index as u64 * self.block_size).min(file_length);
        let length = self.block_size.min(file_length - offset);
        (offset, length as usize)
    }

    //output an iterator over (start_offset, length)
    pub fn ranges(&self, file_length: u64) -> impl Iterator<Item = (u64, usize)> + '_ {
        (0..self.block_count).map(move |index| self.block_range(index, file_length))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::MIB;

    #[test]
    fn small_files_use_min_block_size() {
        let plan = BlockPlan::new(10 * MIB + 1, 4 * MIB, false);
        assert_eq!(plan.block_size, 4 * MIB);
        assert_eq!(plan.block_count, 3);
        assert_eq!(
            vec![(0, 4 * MIB as usize), (4 * MIB, 4 * MIB as usize), (8 * MIB, 2 * MIB as usize + 1)],
            plan.ranges(10 * MIB + 1).collect::<Vec<_>>()
        );
    }

    #[test]
    fn exactly_999_blocks_keeps_min_block_size() {
        let plan = BlockPlan::new(999 * MIB, MIB, false);
        assert_eq!(plan.block_size, MIB);
        assert_eq!(plan.block_count, 999);

        let plan = BlockPlan::new(999 * MIB + 1, MIB, false);
        assert_eq!(plan.block_size, (999 * MIB + 1) / 999 + 1);
        assert!(plan.block_count <= 999);
    }

    #[test]
    fn large_file_is_capped_at_999_blocks() {
        let length = 2000 * MIB;
        let plan = BlockPlan::new(length, MIB, false);
        assert_eq!(plan.block_size, length / 999 + 1);
        assert_eq!(plan.block_count, length.div_ceil(plan.block_size) as usize);
        assert!(plan.block_count <= 999);
    }

    #[test]
    fn block_count_invariant_holds() {
        let min_sizes = [1, 7, 4096, MIB, 4 * MIB];
        let lengths = [
            1,
            2,
            998,
            999,
            1000,
            4095,
            4097,
            MIB - 1,
            999 * MIB,
            999 * MIB + 1,
            123_456_789_012,
        ];
        for min in min_sizes {
            for length in lengths {
                let plan = BlockPlan::new(length, min, false);
                assert!(plan.block_size >= 1);
                assert!(plan.block_count <= 999, "{length} / {min} => {plan}");
                assert_eq!(plan.block_count as u64, length.div_ceil(plan.block_size));

                let covered: u64 = plan.ranges(length).map(|(_, len)| len as u64).sum();
                assert_eq!(covered, length);
            }
        }
    }

    #[test]
    fn single_block_mode() {
        let plan = BlockPlan::new(5000 * MIB, MIB, true);
        assert_eq!(plan.block_size, 5000 * MIB);
        assert_eq!(plan.block_count, 1);
    }

    #[test]
    fn empty_file_has_one_empty_block() {
        for single in [false, true] {
            let plan = BlockPlan::new(0, 4 * MIB, single);
            assert_eq!(plan.block_count, 1);
            assert_eq!(vec![(0, 0)], plan.ranges(0).collect::<Vec<_>>());
        }
    }
}
