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

//! Shuffle-wide statistics: `getStatistics`'s output, plus the standalone
//! "equally divide" bucket-splitting algorithm it uses to parallelize
//! aggregation over large reduce-partition counts (§8 invariant 9).

use crate::map_status::MapStatus;
use crate::ShuffleId;

/// Per-partition byte totals for one shuffle, plus the id of the
/// `ShuffleDependency` that produced them, so the scheduler can attribute
/// task metrics back to the right stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOutputStatistics {
    pub shuffle_id: ShuffleId,
    pub bytes_by_partition: Vec<u64>,
}

/// Split `num_elements` into `num_buckets` contiguous ranges whose sizes
/// differ by at most one, with the wider buckets (`quotient + 1`
/// elements) preceding the narrower ones (`quotient` elements). Returns
/// the buckets as half-open `[start, end)` ranges; `sum(len) ==
/// num_elements` always holds, even when `num_buckets == 0` (empty
/// result) or `num_buckets > num_elements` (some buckets are empty... but
/// such configurations aren't produced by the caller, which always picks
/// `num_buckets <= num_elements`).
pub fn equally_divide(num_elements: u32, num_buckets: usize) -> Vec<std::ops::Range<u32>> {
    if num_buckets == 0 {
        return Vec::new();
    }
    let quotient = num_elements as usize / num_buckets;
    let remainder = num_elements as usize % num_buckets;

    let mut buckets = Vec::with_capacity(num_buckets);
    let mut start = 0u32;
    for bucket_index in 0..num_buckets {
        let size = if bucket_index < remainder {
            quotient + 1
        } else {
            quotient
        } as u32;
        buckets.push(start..start + size);
        start += size;
    }
    buckets
}

/// Sum `getSizeForBlock` across every map, for every partition in
/// `[0, num_partitions)`. Above `parallel_aggregation_threshold` (measured
/// as `num_maps * num_partitions`), the caller should split the partition
/// range with [`equally_divide`] and aggregate each bucket independently
/// (e.g. on a thread pool); this function itself just aggregates one
/// contiguous range, so it composes either way.
pub fn aggregate_partition_sizes(
    map_statuses: &[Option<MapStatus>],
    partition_range: std::ops::Range<u32>,
) -> Vec<u64> {
    let mut totals = vec![0u64; partition_range.len()];
    for status in map_statuses.iter().flatten() {
        for (offset, partition_id) in partition_range.clone().enumerate() {
            totals[offset] += status.get_size_for_block(partition_id);
        }
    }
    totals
}

/// `getStatistics`: full per-partition totals over every map, optionally
/// parallelized by splitting `[0, num_partitions)` via [`equally_divide`]
/// once `num_maps * num_partitions` exceeds `parallel_aggregation_threshold`.
pub fn get_statistics(
    shuffle_id: ShuffleId,
    map_statuses: &[Option<MapStatus>],
    num_partitions: u32,
    parallel_aggregation_threshold: u64,
    num_buckets_hint: usize,
) -> MapOutputStatistics {
    let element_count = map_statuses.len() as u64 * num_partitions as u64;
    let bytes_by_partition = if element_count > parallel_aggregation_threshold && num_buckets_hint > 1
    {
        let buckets = equally_divide(num_partitions, num_buckets_hint.min(num_partitions.max(1) as usize));
        let mut totals = vec![0u64; num_partitions as usize];
        for bucket in buckets {
            let partial = aggregate_partition_sizes(map_statuses, bucket.clone());
            totals[bucket.start as usize..bucket.end as usize].copy_from_slice(&partial);
        }
        totals
    } else {
        aggregate_partition_sizes(map_statuses, 0..num_partitions)
    };

    MapOutputStatistics {
        shuffle_id,
        bytes_by_partition,
    }
}
