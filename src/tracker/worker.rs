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

//! Component C: the executor-side map-output tracker client. Caches
//! decoded status arrays per shuffle id, coalesces concurrent first-time
//! fetches of the same shuffle behind a per-shuffle-id keyed lock, and
//! drops its caches whenever the driver's epoch moves past what it has
//! last seen.

use crate::bitmap::MapIndexBitmap;
use crate::block_manager_id::BlockManagerId;
use crate::broadcast::BroadcastManager;
use crate::convert::{self, FetchBlock};
use crate::error::Result;
use crate::map_status::MapStatus;
use crate::merge_status::MergeStatus;
use crate::shuffle_status;
use crate::ShuffleId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stands in for the RPC client the real tracker worker would hold: given
/// a shuffle id, returns the tag-prefixed, compressed bytes produced by
/// [`crate::shuffle_status::ShuffleStatus::serialized_output_status`]
/// (§4.A, §6). A same-process deployment can implement this by calling
/// straight into a [`crate::tracker::master::MapOutputTrackerMaster`]; a
/// real deployment implements it over the transport.
pub trait StatusFetcher: Send + Sync {
    fn fetch_map_output_statuses(&self, shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>>;
    fn fetch_merge_result_statuses(&self, shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>>;
}

pub struct MapOutputTrackerWorker {
    cached_map_statuses: DashMap<ShuffleId, Arc<Vec<Option<MapStatus>>>>,
    cached_merge_statuses: DashMap<ShuffleId, Arc<Vec<Option<MergeStatus>>>>,
    fetch_locks: DashMap<ShuffleId, Arc<Mutex<()>>>,
    epoch: Mutex<u64>,
    fetcher: Arc<dyn StatusFetcher>,
    broadcast_manager: Arc<dyn BroadcastManager>,
    push_shuffle_enabled: bool,
}

impl MapOutputTrackerWorker {
    pub fn new(
        fetcher: Arc<dyn StatusFetcher>,
        broadcast_manager: Arc<dyn BroadcastManager>,
        push_shuffle_enabled: bool,
    ) -> Self {
        Self {
            cached_map_statuses: DashMap::new(),
            cached_merge_statuses: DashMap::new(),
            fetch_locks: DashMap::new(),
            epoch: Mutex::new(0),
            fetcher,
            broadcast_manager,
            push_shuffle_enabled,
        }
    }

    pub fn current_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Under the epoch lock: clears both caches iff `new_epoch` is
    /// strictly greater than what's locally known (§4.C, §8 invariant 4).
    pub fn update_epoch(&self, new_epoch: u64) {
        let mut epoch = self.epoch.lock();
        if new_epoch > *epoch {
            *epoch = new_epoch;
            self.cached_map_statuses.clear();
            self.cached_merge_statuses.clear();
        }
    }

    fn lock_for(&self, shuffle_id: ShuffleId) -> Arc<Mutex<()>> {
        self.fetch_locks
            .entry(shuffle_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn decode_map_statuses(&self, bytes: &[u8]) -> Result<Vec<Option<MapStatus>>> {
        let raw = shuffle_status::decode_status_payload(bytes, self.broadcast_manager.as_ref())?;
        Ok(bincode::deserialize(&raw)?)
    }

    fn decode_merge_statuses(&self, bytes: &[u8]) -> Result<Vec<Option<MergeStatus>>> {
        let raw = shuffle_status::decode_status_payload(bytes, self.broadcast_manager.as_ref())?;
        Ok(bincode::deserialize(&raw)?)
    }

    /// `getStatuses`: cache hit avoids the RPC entirely; a miss is
    /// coalesced behind the per-shuffle-id keyed lock so concurrently
    /// racing callers for the same shuffle only ever trigger one RPC
    /// round trip. Different shuffle ids never block each other.
    fn get_statuses(
        &self,
        shuffle_id: ShuffleId,
    ) -> Result<(Arc<Vec<Option<MapStatus>>>, Option<Arc<Vec<Option<MergeStatus>>>>)> {
        if let Some(cached_map) = self.cached_map_statuses.get(&shuffle_id) {
            let cached_merge = if self.push_shuffle_enabled {
                self.cached_merge_statuses.get(&shuffle_id).map(|e| e.value().clone())
            } else {
                None
            };
            if !self.push_shuffle_enabled || cached_merge.is_some() {
                return Ok((cached_map.value().clone(), cached_merge));
            }
        }

        let lock = self.lock_for(shuffle_id);
        let _guard = lock.lock();

        // second winner: another thread may have just populated the cache
        // while we waited for the lock.
        if let Some(cached_map) = self.cached_map_statuses.get(&shuffle_id) {
            let cached_merge = if self.push_shuffle_enabled {
                self.cached_merge_statuses.get(&shuffle_id).map(|e| e.value().clone())
            } else {
                None
            };
            if !self.push_shuffle_enabled || cached_merge.is_some() {
                return Ok((cached_map.value().clone(), cached_merge));
            }
        }

        let map_bytes = self.fetcher.fetch_map_output_statuses(shuffle_id)?;
        let map_statuses = Arc::new(self.decode_map_statuses(&map_bytes)?);
        self.cached_map_statuses.insert(shuffle_id, map_statuses.clone());

        let merge_statuses = if self.push_shuffle_enabled {
            let merge_bytes = self.fetcher.fetch_merge_result_statuses(shuffle_id)?;
            let merge_statuses = Arc::new(self.decode_merge_statuses(&merge_bytes)?);
            self.cached_merge_statuses.insert(shuffle_id, merge_statuses.clone());
            Some(merge_statuses)
        } else {
            None
        };

        Ok((map_statuses, merge_statuses))
    }

    /// On any `MetadataFetchFailed` bubbling out of conversion, the cache
    /// for this shuffle is stale or partial and must be dropped before
    /// rethrowing, so the next caller re-fetches rather than reusing the
    /// same broken snapshot (§4.C).
    pub fn get_map_sizes_by_executor_id(
        &self,
        shuffle_id: ShuffleId,
        map_range: std::ops::Range<i64>,
        partition_range: std::ops::Range<u32>,
    ) -> Result<BTreeMap<BlockManagerId, Vec<FetchBlock>>> {
        let (map_statuses, merge_statuses) = self.get_statuses(shuffle_id)?;
        let merge_slice = merge_statuses.as_ref().map(|arc| arc.as_slice());
        match convert::convert_map_statuses(shuffle_id, partition_range, &map_statuses, map_range, merge_slice) {
            Ok(plan) => Ok(plan),
            Err(err) => {
                self.cached_map_statuses.remove(&shuffle_id);
                self.cached_merge_statuses.remove(&shuffle_id);
                Err(err)
            }
        }
    }

    /// `getMapSizesForMergeResult`: the pull-fallback path after a merged
    /// fetch fails, either for the whole partition (tracker from the
    /// cached `MergeStatus`) or for one failed chunk (`chunk_bitmap`,
    /// §1.2 "Chunk tracker bitmaps for merged blocks").
    pub fn get_map_sizes_for_merge_result(
        &self,
        shuffle_id: ShuffleId,
        partition_id: u32,
        chunk_bitmap: Option<&MapIndexBitmap>,
    ) -> Result<BTreeMap<BlockManagerId, Vec<FetchBlock>>> {
        let (map_statuses, merge_statuses) = self.get_statuses(shuffle_id)?;
        let num_maps = map_statuses.len() as u32;

        let missing = match chunk_bitmap {
            Some(bitmap) => bitmap.missing(num_maps),
            None => {
                let merge_statuses = merge_statuses.ok_or_else(|| {
                    crate::error::ShuffleCoreError::MetadataFetchFailed {
                        shuffle_id,
                        partition_id,
                        reason: "push shuffle disabled, no merge statuses cached".to_string(),
                    }
                })?;
                let merge_status = merge_statuses
                    .get(partition_id as usize)
                    .and_then(|s| s.as_ref())
                    .ok_or_else(|| crate::error::ShuffleCoreError::MetadataFetchFailed {
                        shuffle_id,
                        partition_id,
                        reason: "no merge status for partition".to_string(),
                    })?;
                merge_status.get_missing_maps(num_maps)
            }
        };

        let mut plan: BTreeMap<BlockManagerId, Vec<FetchBlock>> = BTreeMap::new();
        for map_index in missing {
            if let Err(err) =
                convert::push_unmerged_block(&mut plan, shuffle_id, partition_id, map_index as i64, &map_statuses)
            {
                self.cached_map_statuses.remove(&shuffle_id);
                self.cached_merge_statuses.remove(&shuffle_id);
                return Err(err);
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::InMemoryBroadcastManager;
    use crate::shuffle_status::ShuffleStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        status: Arc<ShuffleStatus>,
        map_fetch_count: AtomicUsize,
    }

    impl StatusFetcher for CountingFetcher {
        fn fetch_map_output_statuses(&self, _shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>> {
            self.map_fetch_count.fetch_add(1, Ordering::SeqCst);
            self.status.serialized_output_status(true)
        }

        fn fetch_merge_result_statuses(&self, _shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>> {
            self.status.serialized_output_status(false)
        }
    }

    fn bm(name: &str) -> BlockManagerId {
        BlockManagerId::new(name, format!("host-{name}"), 1000)
    }

    #[test]
    fn cache_hit_avoids_refetch() {
        let broadcast_manager = Arc::new(InMemoryBroadcastManager::new());
        let status = Arc::new(ShuffleStatus::new(1, 1, broadcast_manager.clone(), u64::MAX));
        status.add_map_output(0, MapStatus::compressed(bm("a"), 5, vec![1000]));

        let fetcher = Arc::new(CountingFetcher {
            status,
            map_fetch_count: AtomicUsize::new(0),
        });
        let worker = MapOutputTrackerWorker::new(fetcher.clone(), broadcast_manager, false);

        worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();
        worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();
        assert_eq!(fetcher.map_fetch_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn epoch_increase_clears_cache() {
        let broadcast_manager = Arc::new(InMemoryBroadcastManager::new());
        let status = Arc::new(ShuffleStatus::new(1, 1, broadcast_manager.clone(), u64::MAX));
        status.add_map_output(0, MapStatus::compressed(bm("a"), 5, vec![1000]));

        let fetcher = Arc::new(CountingFetcher {
            status,
            map_fetch_count: AtomicUsize::new(0),
        });
        let worker = MapOutputTrackerWorker::new(fetcher.clone(), broadcast_manager, false);

        worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();
        worker.update_epoch(1);
        worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();
        assert_eq!(fetcher.map_fetch_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn epoch_decrease_or_equal_does_not_clear_cache() {
        let broadcast_manager = Arc::new(InMemoryBroadcastManager::new());
        let status = Arc::new(ShuffleStatus::new(1, 1, broadcast_manager.clone(), u64::MAX));
        status.add_map_output(0, MapStatus::compressed(bm("a"), 5, vec![1000]));

        let fetcher = Arc::new(CountingFetcher {
            status,
            map_fetch_count: AtomicUsize::new(0),
        });
        let worker = MapOutputTrackerWorker::new(fetcher.clone(), broadcast_manager, false);
        worker.update_epoch(5);

        worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();
        worker.update_epoch(5);
        worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).unwrap();
        assert_eq!(fetcher.map_fetch_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_fetch_failure_purges_cache() {
        let broadcast_manager = Arc::new(InMemoryBroadcastManager::new());
        // num_maps = 1 but we never populate it -> null MapStatus -> failure.
        let status = Arc::new(ShuffleStatus::new(1, 0, broadcast_manager.clone(), u64::MAX));

        let fetcher = Arc::new(CountingFetcher {
            status,
            map_fetch_count: AtomicUsize::new(0),
        });
        let worker = MapOutputTrackerWorker::new(fetcher.clone(), broadcast_manager, false);

        assert!(worker.get_map_sizes_by_executor_id(10, 0..1, 0..1).is_err());
        assert!(worker.cached_map_statuses.get(&10).is_none());
    }
}
