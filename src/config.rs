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

//! Configuration for the shuffle data plane (§6 "Config keys").

use crate::error::{Result, ShuffleCoreError};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Which codec compresses the serialized status payload (§6). Only
/// `Zstd` is implemented by this crate's [`crate::shuffle_status`] module;
/// other variants are accepted so configuration round-trips cleanly even
/// when the transport layer supports more codecs than this core does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    Zstd,
    Lz4,
    Snappy,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        CompressionCodec::Zstd
    }
}

/// All config keys enumerated in §6, with the documented defaults.
#[derive(Debug, Clone)]
pub struct ShuffleCoreConfig {
    /// `shuffle.push.maxBlockSizeToPush` — individual blocks larger than
    /// this are never pushed; they stay for pull fallback.
    pub max_block_size_to_push: u64,
    /// `shuffle.push.maxBlockBatchSize` — cap on bytes per push request.
    pub max_block_batch_size: u64,
    /// `reducer.maxSizeInFlight` — default 48 MiB.
    pub max_bytes_in_flight: u64,
    /// `reducer.maxReqsInFlight` — default unbounded.
    pub max_reqs_in_flight: u32,
    /// `reducer.maxBlocksInFlightPerAddress`.
    pub max_blocks_in_flight_per_address: u32,
    /// `shuffle.mapOutput.minSizeForBroadcast` — must be `<=`
    /// `max_rpc_message_size`.
    pub min_size_for_broadcast: u64,
    /// The transport's configured max RPC message size, used only to
    /// validate `min_size_for_broadcast` at startup.
    pub max_rpc_message_size: u64,
    /// `shuffle.mapOutput.dispatcher.numThreads`.
    pub dispatcher_num_threads: usize,
    /// `shuffle.numPushThreads`.
    pub num_push_threads: usize,
    /// `shuffle.reduceLocality.enabled`.
    pub reduce_locality_enabled: bool,
    /// `shuffle.mapOutput.parallelAggregationThreshold` — `numMaps *
    /// numReducers` beyond which `getStatistics` parallelizes.
    pub parallel_aggregation_threshold: u64,
    /// `shuffle.mapStatus.compressionCodec`.
    pub map_status_compression_codec: CompressionCodec,
    /// `REDUCER_PREF_LOCS_FRACTION`-equivalent: the maximum fraction of
    /// maps a merged partition may be missing and still be preferred
    /// locality (default 0.2, i.e. coverage `>= 0.8`).
    pub reducer_pref_locs_missing_fraction: f64,
    /// Fraction threshold used by `getLocationsWithLargestOutputs`.
    pub locality_fraction_threshold: f64,
}

impl Default for ShuffleCoreConfig {
    fn default() -> Self {
        Self {
            max_block_size_to_push: 1 * MIB,
            max_block_batch_size: 3 * MIB,
            max_bytes_in_flight: 48 * MIB,
            max_reqs_in_flight: u32::MAX,
            max_blocks_in_flight_per_address: u32::MAX,
            min_size_for_broadcast: 512 * KIB,
            max_rpc_message_size: 128 * MIB,
            dispatcher_num_threads: 8,
            num_push_threads: num_cpus::get(),
            reduce_locality_enabled: true,
            parallel_aggregation_threshold: 10_000_000,
            map_status_compression_codec: CompressionCodec::default(),
            reducer_pref_locs_missing_fraction: 0.2,
            locality_fraction_threshold: 0.2,
        }
    }
}

impl ShuffleCoreConfig {
    pub fn max_block_size_to_push(mut self, v: u64) -> Self {
        self.max_block_size_to_push = v;
        self
    }

    pub fn max_block_batch_size(mut self, v: u64) -> Self {
        self.max_block_batch_size = v;
        self
    }

    pub fn max_bytes_in_flight(mut self, v: u64) -> Self {
        self.max_bytes_in_flight = v;
        self
    }

    pub fn max_reqs_in_flight(mut self, v: u32) -> Self {
        self.max_reqs_in_flight = v;
        self
    }

    pub fn max_blocks_in_flight_per_address(mut self, v: u32) -> Self {
        self.max_blocks_in_flight_per_address = v;
        self
    }

    pub fn min_size_for_broadcast(mut self, v: u64) -> Self {
        self.min_size_for_broadcast = v;
        self
    }

    pub fn max_rpc_message_size(mut self, v: u64) -> Self {
        self.max_rpc_message_size = v;
        self
    }

    pub fn dispatcher_num_threads(mut self, v: usize) -> Self {
        self.dispatcher_num_threads = v;
        self
    }

    pub fn num_push_threads(mut self, v: usize) -> Self {
        self.num_push_threads = v;
        self
    }

    /// Fail-fast validation run at tracker-master startup (§4.B
    /// "Preconditions & errors").
    pub fn validate(&self) -> Result<()> {
        if self.min_size_for_broadcast > self.max_rpc_message_size {
            return Err(ShuffleCoreError::IllegalConfig(format!(
                "shuffle.mapOutput.minSizeForBroadcast ({}) must be <= the transport's max RPC message size ({})",
                self.min_size_for_broadcast, self.max_rpc_message_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ShuffleCoreConfig::default().validate().is_ok());
    }

    #[test]
    fn broadcast_above_rpc_limit_is_illegal_config() {
        let config = ShuffleCoreConfig::default()
            .max_rpc_message_size(100)
            .min_size_for_broadcast(200);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ShuffleCoreError::IllegalConfig(_)));
    }
}
