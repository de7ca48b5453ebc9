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

//! Identity of a block manager (an executor's or merger's local store).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(executorId, host, port)` triple. Equality is structural, matching
/// the source system's `BlockManagerId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockManagerId {
    pub executor_id: String,
    pub host: String,
    pub port: u16,
}

impl BlockManagerId {
    pub fn new(executor_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            executor_id: executor_id.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BlockManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (executor {})", self.host, self.port, self.executor_id)
    }
}
