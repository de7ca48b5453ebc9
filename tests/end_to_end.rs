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

//! End-to-end scenarios driving a driver-side `MapOutputTrackerMaster`
//! against an executor-side `MapOutputTrackerWorker` through an
//! in-process `StatusFetcher`, plus the pusher's request-slicing and
//! connect-blackout behavior.

use shuffle_core::block_manager_id::BlockManagerId;
use shuffle_core::bitmap::MapIndexBitmap;
use shuffle_core::broadcast::InMemoryBroadcastManager;
use shuffle_core::config::ShuffleCoreConfig;
use shuffle_core::error::ShuffleCoreError;
use shuffle_core::map_status::MapStatus;
use shuffle_core::merge_status::MergeStatus;
use shuffle_core::pusher::{PushThreadPool, ShuffleBlockPusher};
use shuffle_core::tracker::master::MapOutputTrackerMaster;
use shuffle_core::tracker::worker::{MapOutputTrackerWorker, StatusFetcher};
use shuffle_core::transport::{ManagedBuffer, PushResultListener, PushTransport};
use shuffle_core::{Result, ShuffleId};
use std::collections::HashSet;
use std::sync::Arc;

/// Forwards to an in-process `MapOutputTrackerMaster`, standing in for
/// the RPC round trip a real deployment would make over the transport.
struct InProcessFetcher {
    master: Arc<MapOutputTrackerMaster>,
}

impl StatusFetcher for InProcessFetcher {
    fn fetch_map_output_statuses(&self, shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>> {
        self.master.serialized_map_output_status(shuffle_id)
    }

    fn fetch_merge_result_statuses(&self, shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>> {
        self.master.serialized_merge_result_status(shuffle_id)
    }
}

fn new_cluster() -> (Arc<MapOutputTrackerMaster>, MapOutputTrackerWorker, Arc<InMemoryBroadcastManager>) {
    let broadcast_manager = Arc::new(InMemoryBroadcastManager::new());
    let master = Arc::new(
        MapOutputTrackerMaster::new(ShuffleCoreConfig::default(), broadcast_manager.clone())
            .expect("default config validates"),
    );
    let fetcher = Arc::new(InProcessFetcher { master: master.clone() });
    let worker = MapOutputTrackerWorker::new(fetcher, broadcast_manager.clone(), true);
    (master, worker, broadcast_manager)
}

#[test]
fn register_and_fetch_returns_one_group_per_map() {
    let (master, worker, _broadcast) = new_cluster();
    master.register_shuffle(10, 2, 1).unwrap();
    master
        .register_map_output(10, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), 5, vec![1000, 10000]))
        .unwrap();
    master
        .register_map_output(10, 1, MapStatus::compressed(BlockManagerId::new("b", "hostB", 1000), 6, vec![10000, 1000]))
        .unwrap();

    let plan = worker.get_map_sizes_by_executor_id(10, 0..2, 0..1).unwrap();
    assert_eq!(plan.len(), 2);
    let a_blocks = &plan[&BlockManagerId::new("a", "hostA", 1000)];
    assert_eq!(a_blocks.len(), 1);
    assert_eq!(a_blocks[0].size, 1000);
    let b_blocks = &plan[&BlockManagerId::new("b", "hostB", 1000)];
    assert_eq!(b_blocks.len(), 1);
    assert_eq!(b_blocks[0].size, 10000);
}

#[test]
fn unregister_then_refetch_fails_and_stays_failed_from_the_stale_cache_purge() {
    let (master, worker, _broadcast) = new_cluster();
    master.register_shuffle(10, 1, 0).unwrap();
    let loc = BlockManagerId::new("a", "hostA", 1000);
    master.register_map_output(10, 0, MapStatus::compressed(loc.clone(), 5, vec![1000])).unwrap();

    worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();

    master.unregister_map_output(10, 0, &loc).unwrap();
    worker.update_epoch(master.current_epoch());

    let err = worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap_err();
    assert!(matches!(err, ShuffleCoreError::MetadataFetchFailed { shuffle_id: 10, .. }));

    // the purge on failure means a second attempt re-fetches and fails again,
    // rather than quietly returning the stale success from before removal.
    let err2 = worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap_err();
    assert!(matches!(err2, ShuffleCoreError::MetadataFetchFailed { .. }));
}

#[test]
fn broadcast_threshold_switches_tag_and_drops_after_unregister() {
    // A tiny min_size_for_broadcast models "large serialized payload"
    // without constructing a multi-hundred-megabyte status array.
    let config = ShuffleCoreConfig::default().min_size_for_broadcast(10);
    let broadcast_manager = Arc::new(InMemoryBroadcastManager::new());
    let master = Arc::new(MapOutputTrackerMaster::new(config, broadcast_manager).unwrap());

    master.register_shuffle(10, 1, 0).unwrap();
    master
        .register_map_output(10, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), 5, vec![1000; 50]))
        .unwrap();

    let payload = master.serialized_map_output_status(10).unwrap();
    assert_eq!(payload[0], shuffle_core::shuffle_status::TAG_BROADCAST);

    master.unregister_shuffle(10).unwrap();
    // the ShuffleStatus (and its broadcast handle) is gone with the shuffle;
    // a fresh registration must serialize from scratch.
    master.register_shuffle(10, 1, 0).unwrap();
    master
        .register_map_output(10, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), 5, vec![1]))
        .unwrap();
    let small_payload = master.serialized_map_output_status(10).unwrap();
    assert_eq!(small_payload[0], shuffle_core::shuffle_status::TAG_DIRECT);
}

#[test]
fn merged_fetch_with_holes_supplements_only_the_missing_map() {
    let (master, worker, _broadcast) = new_cluster();
    master.register_shuffle(10, 4, 1).unwrap();
    for map_index in 0..4u32 {
        master
            .register_map_output(
                10,
                map_index as usize,
                MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), map_index as i64, vec![1000]),
            )
            .unwrap();
    }
    master
        .register_merge_result(
            10,
            0,
            MergeStatus::new(BlockManagerId::new("merger", "hostM", 2000), MapIndexBitmap::from_indices([0, 1, 3]), 3000),
        )
        .unwrap();

    let plan = worker.get_map_sizes_by_executor_id(10, 0..4, 0..1).unwrap();
    let merger_blocks = &plan[&BlockManagerId::new("merger", "hostM", 2000)];
    assert_eq!(merger_blocks.len(), 1);
    assert_eq!(merger_blocks[0].size, 3000);
    assert_eq!(merger_blocks[0].map_index, -1);

    let mapper_blocks = &plan[&BlockManagerId::new("a", "hostA", 1000)];
    assert_eq!(mapper_blocks.len(), 1);
    assert_eq!(mapper_blocks[0].map_index, 2);
}

#[test]
fn merge_result_fallback_recovers_missing_maps_after_a_chunk_failure() {
    let (master, worker, _broadcast) = new_cluster();
    master.register_shuffle(10, 3, 1).unwrap();
    for map_index in 0..3u32 {
        master
            .register_map_output(
                10,
                map_index as usize,
                MapStatus::compressed(BlockManagerId::new("a", "hostA", 1000), map_index as i64, vec![500]),
            )
            .unwrap();
    }
    master
        .register_merge_result(
            10,
            0,
            MergeStatus::new(BlockManagerId::new("merger", "hostM", 2000), MapIndexBitmap::from_indices([0, 1]), 1000),
        )
        .unwrap();

    // a chunk-scoped bitmap covering maps 0 and 2 means only map 1 is
    // "missing" from this particular chunk.
    let chunk_bitmap = MapIndexBitmap::from_indices([0, 2]);
    let plan = worker.get_map_sizes_for_merge_result(10, 0, Some(&chunk_bitmap)).unwrap();
    let mapper_blocks = &plan[&BlockManagerId::new("a", "hostA", 1000)];
    assert_eq!(mapper_blocks.len(), 1);
    assert_eq!(mapper_blocks[0].map_index, 1);
}

struct RecordingTransport {
    fail_destinations: HashSet<BlockManagerId>,
}

impl PushTransport for RecordingTransport {
    fn push_blocks(
        &self,
        destination: &BlockManagerId,
        block_ids: &[String],
        buffers: &[ManagedBuffer],
        listener: Arc<dyn PushResultListener>,
    ) {
        if self.fail_destinations.contains(destination) {
            for block_id in block_ids {
                listener.on_block_push_failure(
                    block_id,
                    &ShuffleCoreError::ConnectError {
                        location: destination.clone(),
                        reason: "refused".to_string(),
                    },
                );
            }
        } else {
            for (block_id, buffer) in block_ids.iter().zip(buffers) {
                listener.on_block_push_success(block_id, buffer.len() as u64);
            }
        }
    }
}

fn merger(name: &str) -> BlockManagerId {
    BlockManagerId::new(name, format!("host-{name}"), 9000)
}

#[test]
fn push_request_slicing_drops_zero_and_oversized_blocks() {
    let data = Arc::new(vec![0u8; 1024]);
    let transport = Arc::new(RecordingTransport { fail_destinations: HashSet::new() });
    let pool = PushThreadPool::new(2);
    let config = ShuffleCoreConfig::default().max_block_size_to_push(1000);
    let pusher = ShuffleBlockPusher::new(
        10,
        5,
        &[100, 0, 200, 1001, 150],
        data,
        vec![merger("m0")],
        config,
        transport,
        pool.clone(),
    );
    pusher.initiate_block_push();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(pusher.is_finished());
    pool.shutdown();
}

#[test]
fn connect_blackout_persists_for_new_requests_too() {
    let data = Arc::new(vec![0u8; 1024]);
    let mut fail = HashSet::new();
    fail.insert(merger("m0"));
    let transport = Arc::new(RecordingTransport { fail_destinations: fail });
    let pool = PushThreadPool::new(2);
    let pusher = ShuffleBlockPusher::new(
        10,
        5,
        &[10, 20],
        data,
        vec![merger("m0")],
        ShuffleCoreConfig::default().max_block_batch_size(10),
        transport,
        pool.clone(),
    );
    pusher.initiate_block_push();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(pusher.unreachable_destinations().contains(&merger("m0")));
    assert!(pusher.is_finished(), "requests to a blacked-out destination are dropped, not retried");
    pool.shutdown();
}
