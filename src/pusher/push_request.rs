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

//! `prepareBlockPushRequests`: slices one map task's completed shuffle
//! data file into [`PushRequest`]s, one merger destination per partition,
//! greedily batched within the configured size/count limits.

use crate::block_id::BlockId;
use crate::block_manager_id::BlockManagerId;
use crate::ShuffleId;
use rand::seq::SliceRandom;

/// A contiguous byte range of the shuffle data file. Loaded once at
/// dispatch time and reused for every block's sub-view (§1.2 "Push-side
/// file-segment lifetime").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    pub offset: u64,
    pub length: u64,
}

/// One push: a destination merger, the blocks bound for it, and the file
/// segment backing them. `blocks` are contiguous bytes in the source
/// file, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub destination: BlockManagerId,
    pub blocks: Vec<(BlockId, u64)>,
    pub req_buffer: FileSegment,
}

impl PushRequest {
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|(_, size)| *size).sum()
    }
}

struct Accumulator {
    merger_index: usize,
    offset: u64,
    length: u64,
    blocks: Vec<(BlockId, u64)>,
}

impl Accumulator {
    fn finish(self, merger_locs: &[BlockManagerId]) -> PushRequest {
        PushRequest {
            destination: merger_locs[self.merger_index].clone(),
            blocks: self.blocks,
            req_buffer: FileSegment {
                offset: self.offset,
                length: self.length,
            },
        }
    }
}

/// `mergerId = min(floor(reduceId / numPartitions * numMergers), numMergers - 1)`
/// (§4.E point 1): every mapper computes the same assignment independently.
fn assign_merger(reduce_id: u32, num_partitions: u32, num_mergers: usize) -> usize {
    let fraction = reduce_id as f64 / num_partitions as f64 * num_mergers as f64;
    (fraction.floor() as usize).min(num_mergers - 1)
}

/// Greedy single pass over partitions (§4.E point 2-6). Zero-sized blocks
/// are skipped without interrupting contiguity (they occupy no file
/// bytes); oversized blocks are skipped *and* flush whatever request was
/// accumulating, since the skipped bytes are a real gap in the file that
/// the next request's segment must not straddle.
///
/// The returned order is randomized (Fisher-Yates) so concurrent mappers
/// don't all hit the same merger first.
pub fn prepare_block_push_requests(
    shuffle_id: ShuffleId,
    map_id: i64,
    partition_lengths: &[u64],
    merger_locs: &[BlockManagerId],
    max_block_size_to_push: u64,
    max_block_batch_size: u64,
    max_blocks_in_flight_per_address: u32,
) -> Vec<PushRequest> {
    assert!(!merger_locs.is_empty(), "at least one merger is required");

    let num_partitions = partition_lengths.len() as u32;
    let mut requests = Vec::new();
    let mut current: Option<Accumulator> = None;
    let mut offset_cursor: u64 = 0;

    for (reduce_id, &len) in partition_lengths.iter().enumerate() {
        let reduce_id = reduce_id as u32;
        let file_offset = offset_cursor;
        offset_cursor += len;

        if len == 0 {
            continue;
        }

        if len > max_block_size_to_push {
            if let Some(acc) = current.take() {
                requests.push(acc.finish(merger_locs));
            }
            continue;
        }

        let merger_index = assign_merger(reduce_id, num_partitions, merger_locs.len());
        let block_id = BlockId::Shuffle {
            shuffle_id,
            map_id,
            reduce_id,
        };

        let must_flush = match &current {
            None => false,
            Some(acc) => {
                acc.merger_index != merger_index
                    || acc.length + len > max_block_batch_size
                    || acc.blocks.len() as u32 >= max_blocks_in_flight_per_address
            }
        };
        if must_flush {
            requests.push(current.take().unwrap().finish(merger_locs));
        }

        match &mut current {
            Some(acc) => {
                acc.length += len;
                acc.blocks.push((block_id, len));
            }
            None => {
                current = Some(Accumulator {
                    merger_index,
                    offset: file_offset,
                    length: len,
                    blocks: vec![(block_id, len)],
                });
            }
        }
    }
    if let Some(acc) = current.take() {
        requests.push(acc.finish(merger_locs));
    }

    requests.shuffle(&mut rand::thread_rng());
    requests
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merger(name: &str) -> BlockManagerId {
        BlockManagerId::new(name, format!("host-{name}"), 9000)
    }

    #[test]
    fn drops_zero_and_oversized_blocks_and_splits_on_the_gap() {
        let partition_lengths = vec![100u64, 0, 200, 1001, 150];
        let requests = prepare_block_push_requests(
            10,
            5,
            &partition_lengths,
            &[merger("m0")],
            1000, // max_block_size_to_push
            u64::MAX,
            u32::MAX,
        );

        let total: u64 = requests.iter().map(|r| r.size()).sum();
        assert_eq!(total, 450);
        assert!(requests
            .iter()
            .flat_map(|r| &r.blocks)
            .all(|(block_id, _)| !matches!(block_id, BlockId::Shuffle { reduce_id: 3, .. })));
    }

    #[test]
    fn single_merger_groups_everything_below_batch_limit() {
        let partition_lengths = vec![10u64, 20, 30];
        let requests = prepare_block_push_requests(
            10,
            5,
            &partition_lengths,
            &[merger("m0")],
            u64::MAX,
            u64::MAX,
            u32::MAX,
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].size(), 60);
        assert_eq!(requests[0].req_buffer, FileSegment { offset: 0, length: 60 });
    }

    #[test]
    fn batch_size_limit_splits_requests_without_dropping_bytes() {
        let partition_lengths = vec![10u64, 10, 10, 10];
        let requests = prepare_block_push_requests(
            10,
            5,
            &partition_lengths,
            &[merger("m0")],
            u64::MAX,
            15, // at most one block of 10 fits safely, two would exceed 15
            u32::MAX,
        );
        let total: u64 = requests.iter().map(|r| r.size()).sum();
        assert_eq!(total, 40);
        assert!(requests.iter().all(|r| r.size() <= 15));
    }

    #[test]
    fn every_request_targets_exactly_one_merger() {
        let partition_lengths = vec![10u64; 6];
        let mergers = vec![merger("m0"), merger("m1")];
        let requests = prepare_block_push_requests(10, 5, &partition_lengths, &mergers, u64::MAX, u64::MAX, u32::MAX);
        for request in &requests {
            assert!(mergers.contains(&request.destination));
        }
    }

    #[test]
    fn max_blocks_in_flight_per_address_caps_block_count() {
        let partition_lengths = vec![10u64; 5];
        let requests = prepare_block_push_requests(10, 5, &partition_lengths, &[merger("m0")], u64::MAX, u64::MAX, 2);
        assert!(requests.iter().all(|r| r.blocks.len() <= 2));
    }
}
