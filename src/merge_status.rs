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

//! `MergeStatus`: the result of merging pushed blocks for one reduce
//! partition into a single file on a merger.

use crate::bitmap::MapIndexBitmap;
use crate::block_manager_id::BlockManagerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeStatus {
    /// The merger holding the merged partition file.
    location: BlockManagerId,
    /// Map indices successfully merged into this partition.
    tracker: MapIndexBitmap,
    /// Size in bytes of the merged partition file.
    total_size: u64,
}

impl MergeStatus {
    pub fn new(location: BlockManagerId, tracker: MapIndexBitmap, total_size: u64) -> Self {
        Self {
            location,
            tracker,
            total_size,
        }
    }

    pub fn location(&self) -> &BlockManagerId {
        &self.location
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn tracker(&self) -> &MapIndexBitmap {
        &self.tracker
    }

    /// Map indices in `[0, num_maps)` that are *not* recorded as merged
    /// into this partition — the complement the reducer must still fetch
    /// directly from the mappers.
    pub fn get_missing_maps(&self, num_maps: u32) -> Vec<u32> {
        self.tracker.missing(num_maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_maps_is_tracker_complement() {
        let status = MergeStatus::new(
            BlockManagerId::new("merger-1", "hostM", 3000),
            MapIndexBitmap::from_indices([0, 1, 3]),
            3000,
        );
        assert_eq!(status.get_missing_maps(4), vec![2]);
    }

    #[test]
    fn empty_tracker_means_all_maps_missing() {
        let status = MergeStatus::new(
            BlockManagerId::new("merger-1", "hostM", 3000),
            MapIndexBitmap::new(),
            0,
        );
        assert_eq!(status.get_missing_maps(3), vec![0, 1, 2]);
    }
}
