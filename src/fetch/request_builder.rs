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

//! Turns an array of block-id strings into one of the three wire fetch
//! messages (§4.F, §6).

use crate::block_id::BlockId;
use crate::error::{Result, ShuffleCoreError};
use crate::transport::BlockFetchingListener;
use crate::ShuffleId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMessage {
    OpenBlocks {
        app_id: String,
        exec_id: String,
        block_ids: Vec<String>,
    },
    FetchShuffleBlocks {
        app_id: String,
        exec_id: String,
        shuffle_id: ShuffleId,
        map_ids: Vec<i64>,
        /// One entry per `map_ids` element. Single blocks store one
        /// reduce id; a batched block stores `[startReduce, endReduce]`.
        reduce_ids: Vec<Vec<u32>>,
        batch_fetch_enabled: bool,
    },
    FetchShuffleBlockChunks {
        app_id: String,
        exec_id: String,
        shuffle_id: ShuffleId,
        reduce_ids: Vec<u32>,
        chunk_ids: Vec<Vec<u32>>,
    },
}

/// Builds the appropriate fetch message for `block_ids` (§4.F). Falls
/// back to `OpenBlocks` when `use_old_fetch_protocol` is set, when any id
/// fails to parse, or when the array mixes the `shuffleChunk_` and
/// `shuffle_` families.
pub fn build_fetch_message(
    app_id: &str,
    exec_id: &str,
    block_ids: &[String],
    use_old_fetch_protocol: bool,
    batch_fetch_enabled: bool,
) -> Result<FetchMessage> {
    if use_old_fetch_protocol {
        return Ok(open_blocks(app_id, exec_id, block_ids));
    }

    let parsed: std::result::Result<Vec<BlockId>, _> = block_ids.iter().map(|s| s.parse::<BlockId>()).collect();
    let ids = match parsed {
        Ok(ids) if !ids.is_empty() => ids,
        _ => return Ok(open_blocks(app_id, exec_id, block_ids)),
    };

    let all_chunk = ids.iter().all(BlockId::is_shuffle_chunk);
    let all_shuffle = ids.iter().all(|id| !id.is_shuffle_chunk());

    if all_chunk {
        build_chunk_message(app_id, exec_id, &ids)
    } else if all_shuffle {
        build_shuffle_blocks_message(app_id, exec_id, &ids, batch_fetch_enabled)
    } else {
        Ok(open_blocks(app_id, exec_id, block_ids))
    }
}

fn open_blocks(app_id: &str, exec_id: &str, block_ids: &[String]) -> FetchMessage {
    FetchMessage::OpenBlocks {
        app_id: app_id.to_string(),
        exec_id: exec_id.to_string(),
        block_ids: block_ids.to_vec(),
    }
}

fn shared_shuffle_id(ids: &[BlockId]) -> Result<ShuffleId> {
    let shuffle_id = ids[0].shuffle_id();
    if ids.iter().any(|id| id.shuffle_id() != shuffle_id) {
        return Err(ShuffleCoreError::IllegalStateTransition(
            "block-fetch request mixes block ids from different shuffles".to_string(),
        ));
    }
    Ok(shuffle_id)
}

fn build_chunk_message(app_id: &str, exec_id: &str, ids: &[BlockId]) -> Result<FetchMessage> {
    let shuffle_id = shared_shuffle_id(ids)?;

    let mut reduce_ids: Vec<u32> = Vec::new();
    let mut chunk_ids: Vec<Vec<u32>> = Vec::new();
    for id in ids {
        if let BlockId::ShuffleChunk { reduce_id, chunk_id, .. } = id {
            match reduce_ids.iter().position(|r| r == reduce_id) {
                Some(index) => chunk_ids[index].push(*chunk_id),
                None => {
                    reduce_ids.push(*reduce_id);
                    chunk_ids.push(vec![*chunk_id]);
                }
            }
        }
    }

    Ok(FetchMessage::FetchShuffleBlockChunks {
        app_id: app_id.to_string(),
        exec_id: exec_id.to_string(),
        shuffle_id,
        reduce_ids,
        chunk_ids,
    })
}

fn build_shuffle_blocks_message(
    app_id: &str,
    exec_id: &str,
    ids: &[BlockId],
    batch_fetch_enabled: bool,
) -> Result<FetchMessage> {
    let shuffle_id = shared_shuffle_id(ids)?;

    let mut map_ids: Vec<i64> = Vec::new();
    let mut reduce_ids: Vec<Vec<u32>> = Vec::new();
    for id in ids {
        let map_id = match id {
            BlockId::Shuffle { map_id, .. } => *map_id,
            BlockId::ShuffleBatch { map_id, .. } => *map_id,
            BlockId::ShuffleChunk { .. } => unreachable!("filtered out by the caller"),
        };
        let index = match map_ids.iter().position(|m| *m == map_id) {
            Some(index) => index,
            None => {
                map_ids.push(map_id);
                reduce_ids.push(Vec::new());
                map_ids.len() - 1
            }
        };
        match id {
            BlockId::Shuffle { reduce_id, .. } => reduce_ids[index].push(*reduce_id),
            BlockId::ShuffleBatch {
                start_reduce_id,
                end_reduce_id,
                ..
            } => {
                reduce_ids[index].push(*start_reduce_id);
                reduce_ids[index].push(*end_reduce_id);
            }
            BlockId::ShuffleChunk { .. } => unreachable!("filtered out by the caller"),
        }
    }

    Ok(FetchMessage::FetchShuffleBlocks {
        app_id: app_id.to_string(),
        exec_id: exec_id.to_string(),
        shuffle_id,
        map_ids,
        reduce_ids,
        batch_fetch_enabled,
    })
}

/// Chunk-receipt callback (§4.F): a failure at `failed_index` fails only
/// that chunk if it's a merged-partition chunk (the reducer will fall
/// back to an unmerged fetch); otherwise the underlying stream is
/// considered unusable past that point, so every subsequent block in the
/// array is failed too.
pub fn handle_chunk_failure(
    block_ids: &[BlockId],
    failed_index: usize,
    error: &ShuffleCoreError,
    listener: &dyn BlockFetchingListener,
) {
    if block_ids[failed_index].is_shuffle_chunk() {
        listener.on_block_fetch_failure(&block_ids[failed_index].to_string(), error);
    } else {
        for id in &block_ids[failed_index..] {
            listener.on_block_fetch_failure(&id.to_string(), error);
        }
    }
}
