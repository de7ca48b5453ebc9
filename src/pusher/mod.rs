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

//! Component E: the mapper-side push engine.

pub mod block_pusher;
pub mod push_request;

pub use block_pusher::{PushFailureClass, PushThreadPool, ShuffleBlockPusher};
pub use push_request::{prepare_block_push_requests, FileSegment, PushRequest};
