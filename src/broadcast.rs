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

//! The broadcast mechanism is an external collaborator (§1): this module
//! specifies only the interface [`ShuffleStatus`](crate::shuffle_status::ShuffleStatus)
//! needs from it, plus a simple in-process implementation usable in tests
//! and in single-driver deployments that don't have a real broadcast
//! manager wired in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A handle to data published through the broadcast mechanism. Owned by
/// the `ShuffleStatus` that created it; destroyed explicitly on cache
/// invalidation or shuffle unregister (§5 "Resource lifetime").
pub trait BroadcastHandle: Send + Sync + std::fmt::Debug {
    /// Opaque id used in the broadcast-handle wire encoding (§6).
    fn id(&self) -> u64;

    /// Tear down the broadcast. Failures here must never propagate: the
    /// caller logs and continues (§7 "Propagation policy").
    fn destroy(&self) -> std::io::Result<()>;
}

/// Creates and owns [`BroadcastHandle`]s for raw serialized bytes.
///
/// `read_broadcast` is not part of the real broadcast mechanism's
/// interface to the driver (the driver only ever creates and destroys
/// handles); it exists here because this crate also stands in for the
/// executor-side half of the broadcast mechanism so tests can exercise a
/// full driver-to-worker round trip without a real cluster manager.
pub trait BroadcastManager: Send + Sync {
    fn new_broadcast(&self, bytes: &[u8]) -> Arc<dyn BroadcastHandle>;

    fn read_broadcast(&self, id: u64) -> Option<Vec<u8>>;
}

/// A broadcast manager that just keeps the bytes in memory, for tests and
/// for single-process deployments. Destruction always succeeds.
type ValueTable = Arc<parking_lot::RwLock<HashMap<u64, Vec<u8>>>>;

#[derive(Debug, Default)]
pub struct InMemoryBroadcastManager {
    next_id: AtomicU64,
    values: ValueTable,
}

impl InMemoryBroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
struct InMemoryBroadcastHandle {
    id: u64,
    values: ValueTable,
}

impl BroadcastHandle for InMemoryBroadcastHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn destroy(&self) -> std::io::Result<()> {
        self.values.write().remove(&self.id);
        Ok(())
    }
}

impl BroadcastManager for InMemoryBroadcastManager {
    fn new_broadcast(&self, bytes: &[u8]) -> Arc<dyn BroadcastHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.values.write().insert(id, bytes.to_vec());
        Arc::new(InMemoryBroadcastHandle {
            id,
            values: self.values.clone(),
        })
    }

    fn read_broadcast(&self, id: u64) -> Option<Vec<u8>> {
        self.values.read().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_is_always_fallible_but_never_panics() {
        let mgr = InMemoryBroadcastManager::new();
        let handle = mgr.new_broadcast(b"payload");
        assert!(handle.destroy().is_ok());
    }

    #[test]
    fn ids_are_distinct() {
        let mgr = InMemoryBroadcastManager::new();
        let a = mgr.new_broadcast(b"x");
        let b = mgr.new_broadcast(b"y");
        assert_ne!(a.id(), b.id());
    }
}
