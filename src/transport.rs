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

//! The transport/RPC layer is an external collaborator (§1): this module
//! specifies only the interfaces the pusher and fetch-request builder
//! call into, not any real network implementation.

use crate::block_manager_id::BlockManagerId;
use crate::error::ShuffleCoreError;
use std::sync::Arc;

/// A read-only view into a loaded buffer. `offset`/`length` describe a
/// sub-range so the pusher can slice one file-segment read into many
/// per-block views without copying (§1.2 "Push-side file-segment
/// lifetime", §4.E point 5).
#[derive(Debug, Clone)]
pub struct ManagedBuffer {
    bytes: Arc<Vec<u8>>,
    offset: usize,
    length: usize,
}

impl ManagedBuffer {
    pub fn whole(bytes: Arc<Vec<u8>>) -> Self {
        let length = bytes.len();
        Self {
            bytes,
            offset: 0,
            length,
        }
    }

    /// A sub-view of `bytes` covering `[offset, offset + length)`. Shares
    /// the same backing allocation as every other view derived from it.
    pub fn slice(bytes: Arc<Vec<u8>>, offset: usize, length: usize) -> Self {
        debug_assert!(offset + length <= bytes.len());
        Self {
            bytes,
            offset,
            length,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Callbacks for one in-flight `pushBlocks` call, invoked on a transport
/// thread (§4.E "Listener callbacks"). Implementations must not block and
/// must not call back into the pusher directly — the pusher's own
/// `PushResultListener` hands work back to its thread pool instead.
pub trait PushResultListener: Send + Sync {
    fn on_block_push_success(&self, block_id: &str, bytes_pushed: u64);
    fn on_block_push_failure(&self, block_id: &str, error: &ShuffleCoreError);
}

/// The mapper-side transport capability the pusher calls into (§6 "Push
/// wire message"). A real implementation opens a connection to
/// `(host, port)` and streams `buffers` tagged with `block_ids`.
pub trait PushTransport: Send + Sync {
    fn push_blocks(
        &self,
        destination: &BlockManagerId,
        block_ids: &[String],
        buffers: &[ManagedBuffer],
        listener: Arc<dyn PushResultListener>,
    );
}

/// One received chunk's callback surface (§4.F "Chunk-receipt callback").
pub trait BlockFetchingListener: Send + Sync {
    fn on_block_fetch_success(&self, block_id: &str, buffer: ManagedBuffer);
    fn on_block_fetch_failure(&self, block_id: &str, error: &ShuffleCoreError);
}
