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

//! Block identifiers: the string grammar shared on the wire between the
//! map-output tracker, the pusher and the fetch-request builder.
//!
//! Three shapes share the `shuffle_`/`shuffleChunk_` namespace:
//!
//! - `shuffle_<shuffleId>_<mapId>_<reduceId>` — a single unmerged block.
//!   `mapId == -1` is the merged-partition sentinel: the block actually
//!   lives on a merger, not a mapper.
//! - `shuffle_<shuffleId>_<mapId>_<startReduce>_<endReduce>` — a
//!   contiguous batch of reduce partitions from one map.
//! - `shuffleChunk_<shuffleId>_<reduceId>_<chunkId>` — one chunk of a
//!   merged partition file.

use crate::ShuffleId;
use std::fmt;

pub const MERGED_MAP_INDEX: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockId {
    /// `shuffle_<shuffleId>_<mapId>_<reduceId>`
    Shuffle {
        shuffle_id: ShuffleId,
        map_id: i64,
        reduce_id: u32,
    },
    /// `shuffle_<shuffleId>_<mapId>_<startReduce>_<endReduce>`
    ShuffleBatch {
        shuffle_id: ShuffleId,
        map_id: i64,
        start_reduce_id: u32,
        end_reduce_id: u32,
    },
    /// `shuffleChunk_<shuffleId>_<reduceId>_<chunkId>`
    ShuffleChunk {
        shuffle_id: ShuffleId,
        reduce_id: u32,
        chunk_id: u32,
    },
}

impl BlockId {
    pub fn shuffle_id(&self) -> ShuffleId {
        match self {
            BlockId::Shuffle { shuffle_id, .. } => *shuffle_id,
            BlockId::ShuffleBatch { shuffle_id, .. } => *shuffle_id,
            BlockId::ShuffleChunk { shuffle_id, .. } => *shuffle_id,
        }
    }

    pub fn is_shuffle_chunk(&self) -> bool {
        matches!(self, BlockId::ShuffleChunk { .. })
    }

    /// True for a `Shuffle` block whose `map_id` is the merged-partition
    /// sentinel (`-1`): the block's bytes live on a merger.
    pub fn is_merged(&self) -> bool {
        matches!(self, BlockId::Shuffle { map_id, .. } if *map_id == MERGED_MAP_INDEX)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Shuffle {
                shuffle_id,
                map_id,
                reduce_id,
            } => write!(f, "shuffle_{}_{}_{}", shuffle_id, map_id, reduce_id),
            BlockId::ShuffleBatch {
                shuffle_id,
                map_id,
                start_reduce_id,
                end_reduce_id,
            } => write!(
                f,
                "shuffle_{}_{}_{}_{}",
                shuffle_id, map_id, start_reduce_id, end_reduce_id
            ),
            BlockId::ShuffleChunk {
                shuffle_id,
                reduce_id,
                chunk_id,
            } => write!(f, "shuffleChunk_{}_{}_{}", shuffle_id, reduce_id, chunk_id),
        }
    }
}

/// Parse error for [`BlockId::parse`]: the grammar is strict, unlike
/// general-purpose wire parsers, because block ids are never
/// attacker-controlled but a single malformed id indicates driver/executor
/// version skew worth failing loudly on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed block id: {0:?}")]
pub struct ParseBlockIdError(pub String);

impl std::str::FromStr for BlockId {
    type Err = ParseBlockIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || ParseBlockIdError(s.to_string());
        let parts: Vec<&str> = s.split('_').collect();

        match parts.first().copied() {
            Some("shuffle") => match parts.len() {
                4 => Ok(BlockId::Shuffle {
                    shuffle_id: parts[1].parse().map_err(|_| err())?,
                    map_id: parts[2].parse().map_err(|_| err())?,
                    reduce_id: parts[3].parse().map_err(|_| err())?,
                }),
                5 => Ok(BlockId::ShuffleBatch {
                    shuffle_id: parts[1].parse().map_err(|_| err())?,
                    map_id: parts[2].parse().map_err(|_| err())?,
                    start_reduce_id: parts[3].parse().map_err(|_| err())?,
                    end_reduce_id: parts[4].parse().map_err(|_| err())?,
                }),
                _ => Err(err()),
            },
            Some("shuffleChunk") => match parts.len() {
                4 => Ok(BlockId::ShuffleChunk {
                    shuffle_id: parts[1].parse().map_err(|_| err())?,
                    reduce_id: parts[2].parse().map_err(|_| err())?,
                    chunk_id: parts[3].parse().map_err(|_| err())?,
                }),
                _ => Err(err()),
            },
            _ => Err(err()),
        }
    }
}
