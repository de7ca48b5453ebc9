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

//! Component B: the driver-side map-output tracker. Owns every shuffle's
//! [`ShuffleStatus`], a dedicated dispatcher pool for status-serialization
//! RPCs (kept isolated from the transport's own dispatcher so a slow
//! broadcast publish or disk read never starves heartbeats), and the
//! epoch counter reducers use to invalidate stale caches.

use crate::broadcast::BroadcastManager;
use crate::block_manager_id::BlockManagerId;
use crate::config::ShuffleCoreConfig;
use crate::error::{Result, ShuffleCoreError};
use crate::map_status::MapStatus;
use crate::merge_status::MergeStatus;
use crate::shuffle_status::ShuffleStatus;
use crate::stats::{self, MapOutputStatistics};
use crate::ShuffleId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

enum StatusRequest {
    MapOutput {
        status: Arc<ShuffleStatus>,
        reply: Sender<Result<Arc<Vec<u8>>>>,
    },
    MergeResult {
        status: Arc<ShuffleStatus>,
        reply: Sender<Result<Arc<Vec<u8>>>>,
    },
    /// Poison sentinel (§4.B, §9 "RPC dispatcher isolation"): a worker
    /// that sees this re-enqueues it before exiting so every peer also
    /// sees it exactly once.
    Stop,
}

/// Driver-side registry over every active shuffle.
pub struct MapOutputTrackerMaster {
    shuffle_statuses: DashMap<ShuffleId, Arc<ShuffleStatus>>,
    epoch: Mutex<u64>,
    request_sender: Sender<StatusRequest>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    config: ShuffleCoreConfig,
    broadcast_manager: Arc<dyn BroadcastManager>,
}

impl MapOutputTrackerMaster {
    /// Validates `config` (§4.B "Preconditions & errors": `minBroadcastSize
    /// <= maxRpcMessageSize`, fail fast) and starts the dispatcher pool.
    pub fn new(config: ShuffleCoreConfig, broadcast_manager: Arc<dyn BroadcastManager>) -> Result<Self> {
        config.validate()?;

        let (request_sender, request_receiver) = unbounded::<StatusRequest>();
        let shuffle_statuses: DashMap<ShuffleId, Arc<ShuffleStatus>> = DashMap::new();

        let mut workers = Vec::with_capacity(config.dispatcher_num_threads);
        for worker_index in 0..config.dispatcher_num_threads {
            let receiver = request_receiver.clone();
            let sender = request_sender.clone();
            let handle = std::thread::Builder::new()
                .name(format!("map-output-dispatcher-{worker_index}"))
                .spawn(move || dispatcher_loop(receiver, sender))
                .expect("failed to spawn map-output dispatcher thread");
            workers.push(handle);
        }

        Ok(Self {
            shuffle_statuses,
            epoch: Mutex::new(0),
            request_sender,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
            config,
            broadcast_manager,
        })
    }

    pub fn config(&self) -> &ShuffleCoreConfig {
        &self.config
    }

    pub fn current_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    fn bump_epoch(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        *epoch
    }

    fn get_status(&self, shuffle_id: ShuffleId) -> Result<Arc<ShuffleStatus>> {
        self.shuffle_statuses
            .get(&shuffle_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ShuffleCoreError::IllegalStateTransition(format!(
                    "no shuffle registered for id {shuffle_id}"
                ))
            })
    }

    pub fn register_shuffle(&self, shuffle_id: ShuffleId, num_maps: usize, num_reducers: usize) -> Result<()> {
        if self.shuffle_statuses.contains_key(&shuffle_id) {
            return Err(ShuffleCoreError::IllegalStateTransition(format!(
                "shuffle {shuffle_id} is already registered"
            )));
        }
        let status = ShuffleStatus::new(
            num_maps,
            num_reducers,
            self.broadcast_manager.clone(),
            self.config.min_size_for_broadcast,
        );
        self.shuffle_statuses.insert(shuffle_id, Arc::new(status));
        Ok(())
    }

    pub fn unregister_shuffle(&self, shuffle_id: ShuffleId) -> Result<()> {
        let (_, status) = self.shuffle_statuses.remove(&shuffle_id).ok_or_else(|| {
            ShuffleCoreError::IllegalStateTransition(format!(
                "cannot unregister unknown shuffle {shuffle_id}"
            ))
        })?;
        status.destroy();
        self.bump_epoch();
        Ok(())
    }

    pub fn register_map_output(&self, shuffle_id: ShuffleId, map_index: usize, status: MapStatus) -> Result<()> {
        self.get_status(shuffle_id)?.add_map_output(map_index, status);
        Ok(())
    }

    pub fn register_merge_result(&self, shuffle_id: ShuffleId, reduce_id: usize, status: MergeStatus) -> Result<()> {
        self.get_status(shuffle_id)?.add_merge_result(reduce_id, status);
        Ok(())
    }

    pub fn unregister_map_output(&self, shuffle_id: ShuffleId, map_index: usize, bm_address: &BlockManagerId) -> Result<()> {
        self.get_status(shuffle_id)?.remove_map_output(map_index, bm_address);
        self.bump_epoch();
        Ok(())
    }

    pub fn unregister_all_map_output(&self, shuffle_id: ShuffleId) -> Result<()> {
        self.get_status(shuffle_id)?.remove_all_map_outputs();
        self.bump_epoch();
        Ok(())
    }

    pub fn unregister_merge_result(&self, shuffle_id: ShuffleId, reduce_id: usize, bm_address: &BlockManagerId) -> Result<()> {
        self.get_status(shuffle_id)?.remove_merge_result(reduce_id, bm_address);
        self.bump_epoch();
        Ok(())
    }

    pub fn update_map_output(&self, shuffle_id: ShuffleId, map_id: i64, new_location: BlockManagerId) -> Result<()> {
        match self.shuffle_statuses.get(&shuffle_id) {
            Some(status) => {
                status.update_map_output(map_id, new_location);
                Ok(())
            }
            None => {
                log::debug!("updateMapOutput for unknown shuffle {shuffle_id}, ignoring");
                Ok(())
            }
        }
    }

    /// `removeOutputsOnHost`/`removeOutputsOnExecutor` (§1.2): sweep every
    /// registered shuffle and bump the epoch exactly once for the call,
    /// regardless of how many shuffles actually had entries removed.
    pub fn remove_outputs_on_host(&self, host: &str) {
        let mut removed_any = false;
        for entry in self.shuffle_statuses.iter() {
            if entry.value().remove_outputs_by_filter(|loc| loc.host == host) {
                removed_any = true;
            }
        }
        if removed_any {
            self.bump_epoch();
        }
    }

    pub fn remove_outputs_on_executor(&self, executor_id: &str) {
        let mut removed_any = false;
        for entry in self.shuffle_statuses.iter() {
            if entry
                .value()
                .remove_outputs_by_filter(|loc| loc.executor_id == executor_id)
            {
                removed_any = true;
            }
        }
        if removed_any {
            self.bump_epoch();
        }
    }

    /// Routes through the dispatcher pool rather than serializing inline,
    /// per §4.B's isolation requirement.
    pub fn serialized_map_output_status(&self, shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>> {
        let status = self.get_status(shuffle_id)?;
        let (reply_tx, reply_rx) = unbounded();
        self.request_sender
            .send(StatusRequest::MapOutput {
                status,
                reply: reply_tx,
            })
            .map_err(|_| ShuffleCoreError::IllegalStateTransition("dispatcher pool stopped".into()))?;
        reply_rx
            .recv()
            .map_err(|_| ShuffleCoreError::IllegalStateTransition("dispatcher worker dropped reply".into()))?
    }

    pub fn serialized_merge_result_status(&self, shuffle_id: ShuffleId) -> Result<Arc<Vec<u8>>> {
        let status = self.get_status(shuffle_id)?;
        let (reply_tx, reply_rx) = unbounded();
        self.request_sender
            .send(StatusRequest::MergeResult {
                status,
                reply: reply_tx,
            })
            .map_err(|_| ShuffleCoreError::IllegalStateTransition("dispatcher pool stopped".into()))?;
        reply_rx
            .recv()
            .map_err(|_| ShuffleCoreError::IllegalStateTransition("dispatcher worker dropped reply".into()))?
    }

    /// `getStatistics` (§4.B, §1.2): per-partition totals plus the
    /// originating shuffle id, parallelized via [`stats::equally_divide`]
    /// once the work exceeds the configured threshold.
    pub fn get_statistics(&self, shuffle_id: ShuffleId, num_partitions: u32) -> Result<MapOutputStatistics> {
        let status = self.get_status(shuffle_id)?;
        let map_statuses = status.map_statuses_snapshot();
        Ok(stats::get_statistics(
            shuffle_id,
            &map_statuses,
            num_partitions,
            self.config.parallel_aggregation_threshold,
            num_cpus::get(),
        ))
    }

    /// Preferred locations for scheduling a reduce task against
    /// `partition_id` (§4.B): merger host first, then the mappers holding
    /// the largest share of that partition's bytes, then none for very
    /// large jobs.
    pub fn get_preferred_locations(&self, shuffle_id: ShuffleId, partition_id: u32) -> Result<Vec<String>> {
        if !self.config.reduce_locality_enabled {
            return Ok(Vec::new());
        }
        let status = self.get_status(shuffle_id)?;
        let merge_statuses = status.merge_statuses_snapshot();
        let num_maps = status.num_maps() as u32;

        if let Some(Some(merge_status)) = merge_statuses.get(partition_id as usize) {
            let missing = merge_status.get_missing_maps(num_maps).len() as f64;
            let missing_fraction = if num_maps == 0 { 0.0 } else { missing / num_maps as f64 };
            if missing_fraction <= self.config.reducer_pref_locs_missing_fraction {
                return Ok(vec![merge_status.location().host.clone()]);
            }
        }

        let num_reducers = status.num_reducers();
        if (status.num_maps() as u32) < 1000 && (num_reducers as u32) < 1000 {
            let map_statuses = status.map_statuses_snapshot();
            return Ok(locations_with_largest_outputs(
                &map_statuses,
                partition_id,
                self.config.locality_fraction_threshold,
            ));
        }

        Ok(Vec::new())
    }

    /// Sends the poison sentinel and joins every dispatcher thread.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.request_sender.send(StatusRequest::Stop);
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for MapOutputTrackerMaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatcher_loop(receiver: Receiver<StatusRequest>, sender: Sender<StatusRequest>) {
    while let Ok(request) = receiver.recv() {
        match request {
            StatusRequest::Stop => {
                let _ = sender.send(StatusRequest::Stop);
                break;
            }
            StatusRequest::MapOutput { status, reply } => {
                let _ = reply.send(status.serialized_output_status(true));
            }
            StatusRequest::MergeResult { status, reply } => {
                let _ = reply.send(status.serialized_output_status(false));
            }
        }
    }
}

/// Sum `getSizeForBlock(partition_id)` by location across every map,
/// returning the locations whose share of the total is at least
/// `fraction_threshold` (§4.B `getLocationsWithLargestOutputs`).
fn locations_with_largest_outputs(
    map_statuses: &[Option<MapStatus>],
    partition_id: u32,
    fraction_threshold: f64,
) -> Vec<String> {
    use std::collections::HashMap;

    let mut totals: HashMap<String, u64> = HashMap::new();
    let mut total: u64 = 0;
    for status in map_statuses.iter().flatten() {
        let size = status.get_size_for_block(partition_id);
        if size == 0 {
            continue;
        }
        total += size;
        *totals.entry(status.location().host.clone()).or_insert(0) += size;
    }
    if total == 0 {
        return Vec::new();
    }
    let mut result: Vec<(String, u64)> = totals
        .into_iter()
        .filter(|(_, bytes)| *bytes as f64 / total as f64 >= fraction_threshold)
        .collect();
    result.sort_by(|a, b| b.1.cmp(&a.1));
    result.into_iter().map(|(host, _)| host).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::MapIndexBitmap;
    use crate::broadcast::InMemoryBroadcastManager;

    fn new_master() -> MapOutputTrackerMaster {
        MapOutputTrackerMaster::new(ShuffleCoreConfig::default(), Arc::new(InMemoryBroadcastManager::new()))
            .expect("default config validates")
    }

    #[test]
    fn register_existing_shuffle_is_illegal_state() {
        let master = new_master();
        master.register_shuffle(1, 2, 2).unwrap();
        let err = master.register_shuffle(1, 2, 2).unwrap_err();
        assert!(matches!(err, ShuffleCoreError::IllegalStateTransition(_)));
    }

    #[test]
    fn unregister_unknown_shuffle_is_illegal_state() {
        let master = new_master();
        let err = master.unregister_shuffle(99).unwrap_err();
        assert!(matches!(err, ShuffleCoreError::IllegalStateTransition(_)));
    }

    #[test]
    fn register_and_fetch_round_trips_through_dispatcher() {
        let master = new_master();
        master.register_shuffle(10, 2, 1).unwrap();
        master
            .register_map_output(10, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1), 5, vec![1000]))
            .unwrap();
        let payload = master.serialized_map_output_status(10).unwrap();
        assert_eq!(payload[0], crate::shuffle_status::TAG_DIRECT);
    }

    #[test]
    fn epoch_bumps_on_removal_not_on_addition() {
        let master = new_master();
        master.register_shuffle(10, 1, 0).unwrap();
        assert_eq!(master.current_epoch(), 0);
        master
            .register_map_output(10, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1), 5, vec![10]))
            .unwrap();
        assert_eq!(master.current_epoch(), 0, "registerMapOutput must not bump the epoch");
        master.unregister_map_output(10, 0, &BlockManagerId::new("a", "hostA", 1)).unwrap();
        assert_eq!(master.current_epoch(), 1);
    }

    #[test]
    fn remove_outputs_on_host_bumps_epoch_once() {
        let master = new_master();
        master.register_shuffle(1, 2, 0).unwrap();
        master.register_shuffle(2, 2, 0).unwrap();
        for shuffle_id in [1, 2] {
            master
                .register_map_output(shuffle_id, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1), 0, vec![10]))
                .unwrap();
        }
        master.remove_outputs_on_host("hostA");
        assert_eq!(master.current_epoch(), 1);
    }

    #[test]
    fn preferred_locations_prefer_merger_when_missing_fraction_is_low() {
        let master = new_master();
        master.register_shuffle(10, 4, 1).unwrap();
        for map_index in 0..4 {
            master
                .register_map_output(10, map_index, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1), map_index as i64, vec![1000]))
                .unwrap();
        }
        master
            .register_merge_result(10, 0, MergeStatus::new(BlockManagerId::new("m", "hostM", 2), MapIndexBitmap::from_indices([0, 1, 2, 3]), 4000))
            .unwrap();
        let locations = master.get_preferred_locations(10, 0).unwrap();
        assert_eq!(locations, vec!["hostM".to_string()]);
    }

    #[test]
    fn get_statistics_returns_per_partition_totals() {
        let master = new_master();
        master.register_shuffle(10, 1, 2).unwrap();
        master
            .register_map_output(10, 0, MapStatus::compressed(BlockManagerId::new("a", "hostA", 1), 0, vec![10, 20]))
            .unwrap();
        let stats = master.get_statistics(10, 2).unwrap();
        assert_eq!(stats.bytes_by_partition, vec![10, 20]);
    }
}
