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

//! Compressed bitmap over map indices, used by [`crate::merge_status::MergeStatus`]
//! to track which maps were successfully merged into a reduce partition.

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

/// A set of map indices. Backed by a roaring bitmap so a partition merged
/// from tens of thousands of maps stays cheap to serialize and to
/// complement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapIndexBitmap(RoaringBitmap);

impl MapIndexBitmap {
    pub fn new() -> Self {
        Self(RoaringBitmap::new())
    }

    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        let mut bm = RoaringBitmap::new();
        for i in indices {
            bm.insert(i);
        }
        Self(bm)
    }

    pub fn insert(&mut self, map_index: u32) -> bool {
        self.0.insert(map_index)
    }

    pub fn contains(&self, map_index: u32) -> bool {
        self.0.contains(map_index)
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Complement of this bitmap within `[0, num_maps)`, i.e. the indices
    /// of maps *not* present, returned in ascending order.
    pub fn missing(&self, num_maps: u32) -> Vec<u32> {
        (0..num_maps).filter(|i| !self.0.contains(*i)).collect()
    }
}

impl Serialize for MapIndexBitmap {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut buf = Vec::with_capacity(self.0.serialized_size());
        self.0
            .serialize_into(&mut buf)
            .map_err(serde::ser::Error::custom)?;
        serde::Serialize::serialize(&buf, serializer)
    }
}

impl<'de> Deserialize<'de> for MapIndexBitmap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let buf: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        let bm = RoaringBitmap::deserialize_from(&buf[..]).map_err(serde::de::Error::custom)?;
        Ok(Self(bm))
    }
}
