// Copyright 2022 The Blaze Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `MapStatus`: where one map task's output lives, and how many bytes it
//! wrote per reduce partition.
//!
//! Modeled as a tagged sum (see design note "Polymorphism over statuses")
//! with two physical encodings sharing one capability surface:
//!
//! - [`CompressedMapStatus`] — per-partition sizes kept directly, the
//!   common case for a moderate number of reduce partitions.
//! - [`HighlyCompressedMapStatus`] — used once the number of reduce
//!   partitions grows large and most blocks are empty: a bitmap of
//!   non-empty partitions plus one average non-empty block size, bounding
//!   memory at the cost of per-block precision.

use crate::block_manager_id::BlockManagerId;
use serde::{Deserialize, Serialize};

/// Encoding with exact per-partition sizes. Chosen as the default encoding
/// here (§3 "may compress" leaves the choice to the implementation): it
/// avoids the log-scale's reconstruction error for the common case of a
/// bounded number of reduce partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedMapStatus {
    location: BlockManagerId,
    map_id: i64,
    block_sizes: Vec<u64>,
}

impl CompressedMapStatus {
    pub fn new(location: BlockManagerId, map_id: i64, block_sizes: Vec<u64>) -> Self {
        Self {
            location,
            map_id,
            block_sizes,
        }
    }
}

/// Encoding for a map with many reduce partitions, most of them empty:
/// an `emptyBlocks`-style bitmap of which partitions are non-empty, plus a
/// single average non-empty block size applied to all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlyCompressedMapStatus {
    location: BlockManagerId,
    map_id: i64,
    num_non_empty_blocks: u32,
    empty_blocks: crate::bitmap::MapIndexBitmap,
    avg_size: u64,
    num_partitions: u32,
}

impl HighlyCompressedMapStatus {
    /// Build from exact per-partition sizes, the way the source system
    /// derives its highly-compressed status from a fully materialized
    /// size array before discarding it.
    pub fn from_sizes(location: BlockManagerId, map_id: i64, block_sizes: &[u64]) -> Self {
        let num_partitions = block_sizes.len() as u32;
        let mut empty_blocks = crate::bitmap::MapIndexBitmap::new();
        let mut total: u128 = 0;
        let mut num_non_empty = 0u32;
        for (i, &size) in block_sizes.iter().enumerate() {
            if size == 0 {
                empty_blocks.insert(i as u32);
            } else {
                total += size as u128;
                num_non_empty += 1;
            }
        }
        let avg_size = if num_non_empty > 0 {
            (total / num_non_empty as u128) as u64
        } else {
            0
        };
        Self {
            location,
            map_id,
            num_non_empty_blocks: num_non_empty,
            empty_blocks,
            avg_size,
            num_partitions,
        }
    }

    fn is_empty_block(&self, partition_id: u32) -> bool {
        self.empty_blocks.contains(partition_id)
    }
}

/// Per-map-task output location and sizes, tagged by physical encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapStatus {
    Compressed(CompressedMapStatus),
    HighlyCompressed(HighlyCompressedMapStatus),
}

impl MapStatus {
    pub fn compressed(location: BlockManagerId, map_id: i64, block_sizes: Vec<u64>) -> Self {
        MapStatus::Compressed(CompressedMapStatus::new(location, map_id, block_sizes))
    }

    pub fn highly_compressed(location: BlockManagerId, map_id: i64, block_sizes: &[u64]) -> Self {
        MapStatus::HighlyCompressed(HighlyCompressedMapStatus::from_sizes(
            location, map_id, block_sizes,
        ))
    }

    pub fn location(&self) -> &BlockManagerId {
        match self {
            MapStatus::Compressed(s) => &s.location,
            MapStatus::HighlyCompressed(s) => &s.location,
        }
    }

    pub fn map_id(&self) -> i64 {
        match self {
            MapStatus::Compressed(s) => s.map_id,
            MapStatus::HighlyCompressed(s) => s.map_id,
        }
    }

    /// Size in bytes of this map's output for `partition_id`. Empty blocks
    /// always report exactly `0`.
    pub fn get_size_for_block(&self, partition_id: u32) -> u64 {
        match self {
            MapStatus::Compressed(s) => s
                .block_sizes
                .get(partition_id as usize)
                .copied()
                .unwrap_or(0),
            MapStatus::HighlyCompressed(s) => {
                if partition_id >= s.num_partitions || s.is_empty_block(partition_id) {
                    0
                } else {
                    s.avg_size
                }
            }
        }
    }

    /// Supports block-manager migration: rewrite the location in place.
    pub fn update_location(&mut self, new_location: BlockManagerId) {
        match self {
            MapStatus::Compressed(s) => s.location = new_location,
            MapStatus::HighlyCompressed(s) => s.location = new_location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_status_reports_exact_sizes() {
        let status =
            MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), 5, vec![1000, 10000]);
        assert_eq!(status.get_size_for_block(0), 1000);
        assert_eq!(status.get_size_for_block(1), 10000);
        assert_eq!(status.map_id(), 5);
    }

    #[test]
    fn empty_block_reports_zero() {
        let status = MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), 5, vec![0, 5]);
        assert_eq!(status.get_size_for_block(0), 0);
        assert_eq!(status.get_size_for_block(5000), 0);
    }

    #[test]
    fn update_location_migrates_in_place() {
        let mut status =
            MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), 5, vec![10]);
        status.update_location(BlockManagerId::new("a", "hostB", 2000));
        assert_eq!(status.location().host, "hostB");
    }

    #[test]
    fn highly_compressed_status_averages_non_empty_blocks() {
        let sizes = vec![0, 100, 0, 300];
        let status =
            MapStatus::highly_compressed(BlockManagerId::new("a", "hostA", 1000), 7, &sizes);
        assert_eq!(status.get_size_for_block(0), 0);
        assert_eq!(status.get_size_for_block(2), 0);
        // average of 100 and 300 is 200, applied to every non-empty block
        assert_eq!(status.get_size_for_block(1), 200);
        assert_eq!(status.get_size_for_block(3), 200);
    }
}
