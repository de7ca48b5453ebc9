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

//! Component A: the per-shuffle in-memory record of `MapStatus[]` and
//! `MergeStatus[]`, with a double-checked serialization cache that
//! opportunistically hands the payload off to broadcast.

use crate::block_manager_id::BlockManagerId;
use crate::broadcast::{BroadcastHandle, BroadcastManager};
use crate::error::Result;
use crate::map_status::MapStatus;
use crate::merge_status::MergeStatus;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tag byte distinguishing the two serialized-status shapes (§6).
pub const TAG_DIRECT: u8 = 0x00;
pub const TAG_BROADCAST: u8 = 0x01;

/// The `value` of a broadcast-handle wire object is itself a
/// `TAG_DIRECT`-tagged payload (§6): "a broadcast-handle object whose
/// `value` holds a DIRECT-tagged array".
#[derive(Serialize, Deserialize)]
struct BroadcastEnvelope {
    id: u64,
    value: Vec<u8>,
}

struct Inner {
    map_statuses: Vec<Option<MapStatus>>,
    merge_statuses: Vec<Option<MergeStatus>>,
    num_available_map_outputs: u32,
    num_available_merge_results: u32,
    cached_serialized_map: Option<Arc<Vec<u8>>>,
    cached_serialized_merge: Option<Arc<Vec<u8>>>,
    cached_broadcast_map: Option<Arc<dyn BroadcastHandle>>,
    cached_broadcast_merge: Option<Arc<dyn BroadcastHandle>>,
}

/// Per-shuffle aggregate of map and merge statuses (component A).
///
/// Thread-safe via a single readers-writer lock (§9 "Lock granularity"):
/// array mutations are `O(1)` and the hot path is reads, so one lock per
/// shuffle is enough — there is no per-entry locking.
pub struct ShuffleStatus {
    num_maps: usize,
    num_reducers: usize,
    inner: RwLock<Inner>,
    broadcast_manager: Arc<dyn BroadcastManager>,
    min_broadcast_size: u64,
}

impl ShuffleStatus {
    pub fn new(
        num_maps: usize,
        num_reducers: usize,
        broadcast_manager: Arc<dyn BroadcastManager>,
        min_broadcast_size: u64,
    ) -> Self {
        Self {
            num_maps,
            num_reducers,
            inner: RwLock::new(Inner {
                map_statuses: vec![None; num_maps],
                merge_statuses: vec![None; num_reducers],
                num_available_map_outputs: 0,
                num_available_merge_results: 0,
                cached_serialized_map: None,
                cached_serialized_merge: None,
                cached_broadcast_map: None,
                cached_broadcast_merge: None,
            }),
            broadcast_manager,
            min_broadcast_size,
        }
    }

    pub fn num_maps(&self) -> usize {
        self.num_maps
    }

    pub fn num_reducers(&self) -> usize {
        self.num_reducers
    }

    pub fn num_available_map_outputs(&self) -> u32 {
        self.inner.read().num_available_map_outputs
    }

    pub fn num_available_merge_results(&self) -> u32 {
        self.inner.read().num_available_merge_results
    }

    pub fn has_cached_broadcast_map(&self) -> bool {
        self.inner.read().cached_broadcast_map.is_some()
    }

    pub fn has_cached_broadcast_merge(&self) -> bool {
        self.inner.read().cached_broadcast_merge.is_some()
    }

    /// Snapshot of the current map-status array, for conversion (§4.D).
    pub fn map_statuses_snapshot(&self) -> Vec<Option<MapStatus>> {
        self.inner.read().map_statuses.clone()
    }

    /// Snapshot of the current merge-status array, for conversion (§4.D).
    pub fn merge_statuses_snapshot(&self) -> Vec<Option<MergeStatus>> {
        self.inner.read().merge_statuses.clone()
    }

    /// `addMapOutput`: always overwrite; increment the counter and
    /// invalidate the cache only when the slot was previously empty.
    pub fn add_map_output(&self, map_index: usize, status: MapStatus) {
        let mut inner = self.inner.write();
        let was_empty = inner.map_statuses[map_index].is_none();
        inner.map_statuses[map_index] = Some(status);
        if was_empty {
            inner.num_available_map_outputs += 1;
        }
        Self::invalidate_map_locked(&mut inner, &self.broadcast_manager);
    }

    /// `updateMapOutput`: linear scan by `mapId`; not found is logged and
    /// ignored, never an error (tasks may race with stage abort).
    pub fn update_map_output(&self, map_id: i64, new_location: BlockManagerId) {
        let mut inner = self.inner.write();
        let found = inner
            .map_statuses
            .iter_mut()
            .flatten()
            .find(|status| status.map_id() == map_id);
        match found {
            Some(status) => {
                status.update_location(new_location);
                Self::invalidate_map_locked(&mut inner, &self.broadcast_manager);
            }
            None => {
                log::debug!(
                    "updateMapOutput called for unknown mapId {map_id}, ignoring \
                     (likely a race with stage abort)"
                );
            }
        }
    }

    /// `removeMapOutput`: no-op unless the current entry's location
    /// matches `bm_address` exactly — protects against races with a
    /// concurrent migration.
    pub fn remove_map_output(&self, map_index: usize, bm_address: &BlockManagerId) {
        let mut inner = self.inner.write();
        let matches = matches!(
            &inner.map_statuses[map_index],
            Some(status) if status.location() == bm_address
        );
        if matches {
            inner.map_statuses[map_index] = None;
            inner.num_available_map_outputs -= 1;
            Self::invalidate_map_locked(&mut inner, &self.broadcast_manager);
        }
    }

    /// `unregisterAllMapOutput`: clear every map-output entry for this
    /// shuffle in one step (used on stage retry), rather than clearing
    /// them one at a time via `removeMapOutput`.
    pub fn remove_all_map_outputs(&self) {
        let mut inner = self.inner.write();
        for slot in inner.map_statuses.iter_mut() {
            *slot = None;
        }
        inner.num_available_map_outputs = 0;
        Self::invalidate_map_locked(&mut inner, &self.broadcast_manager);
    }

    pub fn add_merge_result(&self, reduce_id: usize, status: MergeStatus) {
        let mut inner = self.inner.write();
        let was_empty = inner.merge_statuses[reduce_id].is_none();
        inner.merge_statuses[reduce_id] = Some(status);
        if was_empty {
            inner.num_available_merge_results += 1;
        }
        Self::invalidate_merge_locked(&mut inner, &self.broadcast_manager);
    }

    pub fn remove_merge_result(&self, reduce_id: usize, bm_address: &BlockManagerId) {
        let mut inner = self.inner.write();
        let matches = matches!(
            &inner.merge_statuses[reduce_id],
            Some(status) if status.location() == bm_address
        );
        if matches {
            inner.merge_statuses[reduce_id] = None;
            inner.num_available_merge_results -= 1;
            Self::invalidate_merge_locked(&mut inner, &self.broadcast_manager);
        }
    }

    /// Sweep both arrays, clearing every entry whose location matches
    /// `pred`. Used for `removeOutputsOnHost`/`removeOutputsOnExecutor`.
    /// Returns whether anything was actually removed, so the caller can
    /// decide whether an epoch bump is warranted.
    pub fn remove_outputs_by_filter(&self, pred: impl Fn(&BlockManagerId) -> bool) -> bool {
        let mut inner = self.inner.write();
        let mut removed_any = false;

        for slot in inner.map_statuses.iter_mut() {
            if let Some(status) = slot {
                if pred(status.location()) {
                    *slot = None;
                    removed_any = true;
                }
            }
        }
        if removed_any {
            inner.num_available_map_outputs = inner
                .map_statuses
                .iter()
                .filter(|s| s.is_some())
                .count() as u32;
        }

        let mut removed_merge = false;
        for slot in inner.merge_statuses.iter_mut() {
            if let Some(status) = slot {
                if pred(status.location()) {
                    *slot = None;
                    removed_merge = true;
                }
            }
        }
        if removed_merge {
            inner.num_available_merge_results = inner
                .merge_statuses
                .iter()
                .filter(|s| s.is_some())
                .count() as u32;
        }

        if removed_any {
            Self::invalidate_map_locked(&mut inner, &self.broadcast_manager);
        }
        if removed_merge {
            Self::invalidate_merge_locked(&mut inner, &self.broadcast_manager);
        }
        removed_any || removed_merge
    }

    /// `serializedOutputStatus`: double-checked cache, upgrading to a
    /// write lock only on a miss, so concurrent readers never contend
    /// with each other, only with the rare writer (§8 invariant 5).
    pub fn serialized_output_status(&self, is_map_output: bool) -> Result<Arc<Vec<u8>>> {
        {
            let inner = self.inner.read();
            if let Some(cached) = Self::cached(&inner, is_map_output) {
                return Ok(cached);
            }
        }

        let mut inner = self.inner.write();
        // second winner: recheck now that we hold the write lock.
        if let Some(cached) = Self::cached(&inner, is_map_output) {
            return Ok(cached);
        }

        let raw = if is_map_output {
            bincode::serialize(&inner.map_statuses)?
        } else {
            bincode::serialize(&inner.merge_statuses)?
        };
        let compressed = zstd::encode_all(&raw[..], 0)?;

        let mut direct_payload = Vec::with_capacity(compressed.len() + 1);
        direct_payload.push(TAG_DIRECT);
        direct_payload.extend_from_slice(&compressed);

        let payload = if direct_payload.len() as u64 >= self.min_broadcast_size {
            let handle = self.broadcast_manager.new_broadcast(&direct_payload);
            let envelope = BroadcastEnvelope {
                id: handle.id(),
                value: direct_payload,
            };
            let envelope_bytes = bincode::serialize(&envelope)?;
            let envelope_compressed = zstd::encode_all(&envelope_bytes[..], 0)?;

            if is_map_output {
                inner.cached_broadcast_map = Some(handle);
            } else {
                inner.cached_broadcast_merge = Some(handle);
            }

            let mut broadcast_payload = Vec::with_capacity(envelope_compressed.len() + 1);
            broadcast_payload.push(TAG_BROADCAST);
            broadcast_payload.extend_from_slice(&envelope_compressed);
            broadcast_payload
        } else {
            direct_payload
        };

        let payload = Arc::new(payload);
        if is_map_output {
            inner.cached_serialized_map = Some(payload.clone());
        } else {
            inner.cached_serialized_merge = Some(payload.clone());
        }
        Ok(payload)
    }

    fn cached(inner: &Inner, is_map_output: bool) -> Option<Arc<Vec<u8>>> {
        if is_map_output {
            inner.cached_serialized_map.clone()
        } else {
            inner.cached_serialized_merge.clone()
        }
    }

    fn invalidate_map_locked(inner: &mut Inner, broadcast_manager: &Arc<dyn BroadcastManager>) {
        inner.cached_serialized_map = None;
        if let Some(handle) = inner.cached_broadcast_map.take() {
            destroy_broadcast(handle.as_ref());
        }
        let _ = broadcast_manager; // kept for symmetry/future use; destroy is on the handle itself.
    }

    fn invalidate_merge_locked(inner: &mut Inner, broadcast_manager: &Arc<dyn BroadcastManager>) {
        inner.cached_serialized_merge = None;
        if let Some(handle) = inner.cached_broadcast_merge.take() {
            destroy_broadcast(handle.as_ref());
        }
        let _ = broadcast_manager;
    }

    pub fn invalidate_serialized_map_output_status_cache(&self) {
        let mut inner = self.inner.write();
        Self::invalidate_map_locked(&mut inner, &self.broadcast_manager);
    }

    pub fn invalidate_serialized_merge_output_status_cache(&self) {
        let mut inner = self.inner.write();
        Self::invalidate_merge_locked(&mut inner, &self.broadcast_manager);
    }

    /// Called by `unregisterShuffle`: destroys any cached broadcasts for
    /// both map and merge output, even if only one was ever populated.
    pub fn destroy(&self) {
        self.invalidate_serialized_map_output_status_cache();
        self.invalidate_serialized_merge_output_status_cache();
    }
}

/// Destruction errors are swallowed per §7: cleanup must never crash the
/// driver. Logged at warn level since a leaked broadcast is worth noticing.
fn destroy_broadcast(handle: &dyn BroadcastHandle) {
    if let Err(err) = handle.destroy() {
        log::warn!("failed to destroy broadcast handle {}: {err}", handle.id());
    }
}

/// Decode a serialized-status payload produced by
/// [`ShuffleStatus::serialized_output_status`] back into its status array
/// bytes (still zstd-compressed `bincode`, one level in). Used by the
/// tracker worker once it has received the payload over RPC.
pub fn decode_status_payload(
    payload: &[u8],
    broadcast_manager: &dyn BroadcastManager,
) -> Result<Vec<u8>> {
    let (tag, rest) = payload.split_first().ok_or_else(|| {
        crate::error::ShuffleCoreError::IllegalStateTransition(
            "empty serialized status payload".to_string(),
        )
    })?;
    match *tag {
        TAG_DIRECT => Ok(zstd::decode_all(rest)?),
        TAG_BROADCAST => {
            let envelope_bytes = zstd::decode_all(rest)?;
            let envelope: BroadcastEnvelope = bincode::deserialize(&envelope_bytes)?;
            let direct_payload = broadcast_manager
                .read_broadcast(envelope.id)
                .unwrap_or(envelope.value);
            let (inner_tag, inner_rest) = direct_payload.split_first().ok_or_else(|| {
                crate::error::ShuffleCoreError::IllegalStateTransition(
                    "empty broadcast value".to_string(),
                )
            })?;
            debug_assert_eq!(*inner_tag, TAG_DIRECT);
            Ok(zstd::decode_all(inner_rest)?)
        }
        other => Err(crate::error::ShuffleCoreError::IllegalStateTransition(
            format!("unknown serialized status tag byte {other}"),
        )),
    }
}
