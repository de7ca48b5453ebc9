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

//! Component D: `convertMapStatuses` — turns map/merge status arrays into
//! a per-`BlockManagerId` fetch plan. Pure function, no locking, no I/O.

use crate::block_id::BlockId;
use crate::block_manager_id::BlockManagerId;
use crate::error::{Result, ShuffleCoreError};
use crate::map_status::MapStatus;
use crate::merge_status::MergeStatus;
use crate::ShuffleId;
use std::collections::BTreeMap;

/// One block to fetch: its id, byte size, and the originating map index
/// (`-1` for a merged block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBlock {
    pub block_id: BlockId,
    pub size: u64,
    pub map_index: i64,
}

/// Convert status arrays into a fetch plan grouped by destination.
///
/// `map_range` and `partition_range` are half-open `[start, end)`. The
/// merged branch is only considered when `merge_statuses` is `Some` *and*
/// `map_range == 0..num_maps` — a merged partition is an opaque
/// concatenation of every map's contribution, so it cannot serve a
/// sub-range of maps.
pub fn convert_map_statuses(
    shuffle_id: ShuffleId,
    partition_range: std::ops::Range<u32>,
    map_statuses: &[Option<MapStatus>],
    map_range: std::ops::Range<i64>,
    merge_statuses: Option<&[Option<MergeStatus>]>,
) -> Result<BTreeMap<BlockManagerId, Vec<FetchBlock>>> {
    let num_maps = map_statuses.len() as i64;
    let take_merged_path = merge_statuses.is_some() && map_range == (0..num_maps);

    let mut plan: BTreeMap<BlockManagerId, Vec<FetchBlock>> = BTreeMap::new();

    if take_merged_path {
        let merge_statuses = merge_statuses.unwrap();
        for partition_id in partition_range.clone() {
            match merge_statuses.get(partition_id as usize).and_then(|s| s.as_ref()) {
                Some(merge_status) => {
                    // A merged entry is pushed unconditionally, even when
                    // totalSize is 0 — the size-based filter lives in the
                    // caller, not here.
                    plan.entry(merge_status.location().clone())
                        .or_default()
                        .push(FetchBlock {
                            block_id: BlockId::Shuffle {
                                shuffle_id,
                                map_id: crate::block_id::MERGED_MAP_INDEX,
                                reduce_id: partition_id,
                            },
                            size: merge_status.total_size(),
                            map_index: -1,
                        });
                    for map_index in merge_status.get_missing_maps(num_maps as u32) {
                        push_unmerged_block(
                            &mut plan,
                            shuffle_id,
                            partition_id,
                            map_index as i64,
                            map_statuses,
                        )?;
                    }
                }
                None => {
                    for map_index in 0..num_maps {
                        push_unmerged_block(
                            &mut plan,
                            shuffle_id,
                            partition_id,
                            map_index,
                            map_statuses,
                        )?;
                    }
                }
            }
        }
    } else {
        for map_index in map_range {
            for partition_id in partition_range.clone() {
                push_unmerged_block(&mut plan, shuffle_id, partition_id, map_index, map_statuses)?;
            }
        }
    }

    Ok(plan)
}

pub(crate) fn push_unmerged_block(
    plan: &mut BTreeMap<BlockManagerId, Vec<FetchBlock>>,
    shuffle_id: ShuffleId,
    partition_id: u32,
    map_index: i64,
    map_statuses: &[Option<MapStatus>],
) -> Result<()> {
    let status = map_statuses
        .get(map_index as usize)
        .and_then(|s| s.as_ref())
        .ok_or_else(|| ShuffleCoreError::MetadataFetchFailed {
            shuffle_id,
            partition_id,
            reason: format!("missing map status for map index {map_index}"),
        })?;

    let size = status.get_size_for_block(partition_id);
    if size == 0 {
        return Ok(());
    }

    plan.entry(status.location().clone())
        .or_default()
        .push(FetchBlock {
            block_id: BlockId::Shuffle {
                shuffle_id,
                map_id: status.map_id(),
                reduce_id: partition_id,
            },
            size,
            map_index,
        });
    Ok(())
}
