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

//! Push-based shuffle data plane and map-output tracking core.
//!
//! A shuffle moves each map task's output to the reduce tasks that need
//! it. This crate implements the push-based variant: as mappers finish,
//! their blocks are proactively pushed to a set of merger services that
//! coalesce many small per-reducer blocks into one larger file per
//! partition, so reducers issue far fewer, far larger fetches than they
//! would against the mappers directly. Reducers fall back to fetching
//! unmerged blocks directly from mappers for whatever a merge never
//! picked up.
//!
//! Module map:
//!
//! - [`block_manager_id`] / [`block_id`] — identity and addressing.
//! - [`bitmap`] — compressed map-index sets used by merge tracking.
//! - [`map_status`] / [`merge_status`] — per-map and per-merge metadata.
//! - [`shuffle_status`] — the per-shuffle aggregate record (component A).
//! - [`tracker`] — driver (`master`) and executor (`worker`) sides of map
//!   output tracking (components B, C).
//! - [`convert`] — status arrays to fetch plans (component D).
//! - [`pusher`] — the mapper-side push path (component E).
//! - [`fetch`] — the reducer-side fetch-request builder (component F).
//! - [`stats`] — shuffle-wide statistics and bucket aggregation.
//! - [`broadcast`] — the external broadcast-mechanism interface.
//! - [`transport`] — external transport interfaces this crate calls into.
//! - [`config`] — tunables, all collected in [`config::ShuffleCoreConfig`].
//! - [`error`] — the crate-wide error type.

/// Identifies a shuffle within its application; stable for the shuffle's
/// lifetime, reused across stage retries for the same shuffle dependency.
pub type ShuffleId = u32;

pub mod bitmap;
pub mod block_id;
pub mod block_manager_id;
pub mod broadcast;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod map_status;
pub mod merge_status;
pub mod pusher;
pub mod shuffle_status;
pub mod stats;
pub mod tracker;
pub mod transport;

pub use error::{Result, ShuffleCoreError};
