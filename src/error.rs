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

//! Crate-wide error type for the shuffle data plane.

use crate::block_manager_id::BlockManagerId;
use crate::ShuffleId;

/// Errors surfaced across map-output tracking, block pushing and block
/// fetch-plan conversion.
///
/// Variants are split along the propagation policy from the design: some
/// are surfaced to callers (`MetadataFetchFailed`, `FetchFailed`,
/// `IllegalConfig`, `IllegalStateTransition`), others are absorbed locally
/// by the component that produced them (`ConnectError`, `MergeFinalized`)
/// and only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum ShuffleCoreError {
    /// A `MapStatus` was null during conversion, or a `MergeStatus` was
    /// missing during merge-fallback, for the given shuffle/partition.
    #[error("metadata fetch failed for shuffle {shuffle_id}, partition {partition_id}: {reason}")]
    MetadataFetchFailed {
        shuffle_id: ShuffleId,
        partition_id: u32,
        reason: String,
    },

    /// A transport-level block fetch failed. The caller decides whether to
    /// retry the stage.
    #[error("fetch failed for block manager {location:?}: {reason}")]
    FetchFailed {
        location: BlockManagerId,
        reason: String,
    },

    /// A fatal misconfiguration, detected at startup.
    #[error("illegal configuration: {0}")]
    IllegalConfig(String),

    /// A programming error: e.g. unregistering an unknown shuffle, or
    /// registering one that already exists.
    #[error("illegal state transition: {0}")]
    IllegalStateTransition(String),

    /// A retryable, per-block push failure. Logged, retried by the
    /// transport per its own policy; never surfaced past the pusher.
    #[error("transient push error pushing block {block_id} to {location:?}: {reason}")]
    TransientPushError {
        block_id: String,
        location: BlockManagerId,
        reason: String,
    },

    /// The destination could not be connected to. Absorbed by the pusher:
    /// further blocks to that destination are dropped.
    #[error("connect error to {location:?}: {reason}")]
    ConnectError {
        location: BlockManagerId,
        reason: String,
    },

    /// The merger has finalized the merge for a partition and will accept
    /// no further pushes. Sets the pusher's global stop flag.
    #[error("merge already finalized at {location:?}")]
    MergeFinalized { location: BlockManagerId },

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShuffleCoreError {
    /// Whether this error is the pusher's "recoverable-local" class:
    /// absorbed by the component that produced it rather than surfaced to
    /// the scheduler/task.
    pub fn is_recoverable_local(&self) -> bool {
        matches!(
            self,
            ShuffleCoreError::ConnectError { .. } | ShuffleCoreError::MergeFinalized { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ShuffleCoreError>;
