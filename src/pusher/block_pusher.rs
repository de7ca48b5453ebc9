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

//! `ShuffleBlockPusher`: dispatches one map task's pushes under a single
//! lock, with multi-dimensional flow control and failure classification
//! (§4.E, §5).

use super::push_request::{self, PushRequest};
use crate::block_manager_id::BlockManagerId;
use crate::config::ShuffleCoreConfig;
use crate::error::ShuffleCoreError;
use crate::transport::{ManagedBuffer, PushResultListener, PushTransport};
use crate::ShuffleId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// One pending push outcome, captured by [`PusherListener`] when it fires
/// on the same thread that's still holding `PusherState`'s lock inside
/// [`ShuffleBlockPusher::send_request`] — i.e. a transport that resolves a
/// block synchronously, before `push_blocks` returns. `send_request` drains
/// this right after the call instead of going through the thread pool, so a
/// connect failure blacklists its destination before the dispatch loop
/// looks at that destination's next queued request.
type InlineOutcome = (String, u64, Option<PushFailureClass>);

thread_local! {
    static INLINE_CAPTURE: RefCell<Option<Vec<InlineOutcome>>> = RefCell::new(None);
}

type Job = Box<dyn FnOnce() + Send>;

/// Process-wide fixed pool that listener callbacks hand work back to,
/// since transport threads must never call back into the pusher's lock
/// directly (§4.E "Listener callbacks", §5).
pub struct PushThreadPool {
    sender: Sender<Option<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PushThreadPool {
    pub fn new(num_threads: usize) -> Arc<Self> {
        let (sender, receiver) = unbounded::<Option<Job>>();
        let mut workers = Vec::with_capacity(num_threads);
        for index in 0..num_threads.max(1) {
            let receiver: Receiver<Option<Job>> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("shuffle-push-{index}"))
                .spawn(move || {
                    while let Ok(Some(job)) = receiver.recv() {
                        job();
                    }
                })
                .expect("failed to spawn shuffle push thread");
            workers.push(handle);
        }
        Arc::new(Self {
            sender,
            workers: Mutex::new(workers),
        })
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Some(Box::new(job)));
    }

    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(None);
        }
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Failure classes a transport callback can report (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailureClass {
    Connect,
    MergeFinalized,
    Transient,
}

impl PushFailureClass {
    pub fn classify(error: &ShuffleCoreError) -> Self {
        match error {
            ShuffleCoreError::ConnectError { .. } => PushFailureClass::Connect,
            ShuffleCoreError::MergeFinalized { .. } => PushFailureClass::MergeFinalized,
            _ => PushFailureClass::Transient,
        }
    }
}

struct PusherState {
    push_requests: VecDeque<PushRequest>,
    deferred_push_requests: HashMap<BlockManagerId, VecDeque<PushRequest>>,
    bytes_in_flight: u64,
    reqs_in_flight: u32,
    blocks_in_flight: HashMap<BlockManagerId, u32>,
    /// Per in-flight request, the block ids it's still waiting on.
    request_remaining: HashMap<u64, HashSet<String>>,
    /// block id -> (destination, request id), so a completion callback
    /// carrying only the block id string can find its bookkeeping.
    block_to_request: HashMap<String, (BlockManagerId, u64)>,
    unreachable_block_mgrs: HashSet<BlockManagerId>,
    stop_pushing: bool,
    next_request_id: u64,
}

pub struct ShuffleBlockPusher {
    self_weak: Weak<ShuffleBlockPusher>,
    inner: Mutex<PusherState>,
    config: ShuffleCoreConfig,
    transport: Arc<dyn PushTransport>,
    data: Arc<Vec<u8>>,
    thread_pool: Arc<PushThreadPool>,
}

impl ShuffleBlockPusher {
    pub fn new(
        shuffle_id: ShuffleId,
        map_id: i64,
        partition_lengths: &[u64],
        data: Arc<Vec<u8>>,
        merger_locs: Vec<BlockManagerId>,
        config: ShuffleCoreConfig,
        transport: Arc<dyn PushTransport>,
        thread_pool: Arc<PushThreadPool>,
    ) -> Arc<Self> {
        let requests = push_request::prepare_block_push_requests(
            shuffle_id,
            map_id,
            partition_lengths,
            &merger_locs,
            config.max_block_size_to_push,
            config.max_block_batch_size,
            config.max_blocks_in_flight_per_address,
        );

        Arc::new_cyclic(|weak| ShuffleBlockPusher {
            self_weak: weak.clone(),
            inner: Mutex::new(PusherState {
                push_requests: requests.into(),
                deferred_push_requests: HashMap::new(),
                bytes_in_flight: 0,
                reqs_in_flight: 0,
                blocks_in_flight: HashMap::new(),
                request_remaining: HashMap::new(),
                block_to_request: HashMap::new(),
                unreachable_block_mgrs: HashSet::new(),
                stop_pushing: false,
                next_request_id: 0,
            }),
            config,
            transport,
            data,
            thread_pool,
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("pusher dropped while a push was in flight")
    }

    pub fn initiate_block_push(&self) {
        self.push_up_to_max();
    }

    pub fn is_finished(&self) -> bool {
        let state = self.inner.lock();
        state.push_requests.is_empty() && state.deferred_push_requests.values().all(|q| q.is_empty()) && state.request_remaining.is_empty()
    }

    pub fn unreachable_destinations(&self) -> HashSet<BlockManagerId> {
        self.inner.lock().unreachable_block_mgrs.clone()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.inner.lock().bytes_in_flight
    }

    fn can_dispatch(state: &PusherState, config: &ShuffleCoreConfig, dest: &BlockManagerId, req: &PushRequest) -> bool {
        let req_size = req.size();
        let block_count = req.blocks.len() as u32;
        let global_ok = state.bytes_in_flight == 0
            || (state.reqs_in_flight + 1 <= config.max_reqs_in_flight
                && state.bytes_in_flight + req_size <= config.max_bytes_in_flight);
        let per_dest_ok = state.blocks_in_flight.get(dest).copied().unwrap_or(0) + block_count
            <= config.max_blocks_in_flight_per_address;
        global_ok && per_dest_ok
    }

    /// Dispatch loop (§4.E "pushUpToMax"): drains deferred queues first,
    /// then the main queue, under one lock for the whole pass.
    pub fn push_up_to_max(&self) {
        let mut state = self.inner.lock();
        if state.stop_pushing {
            return;
        }

        let destinations: Vec<BlockManagerId> = state.deferred_push_requests.keys().cloned().collect();
        for dest in destinations {
            loop {
                if state.stop_pushing {
                    break;
                }
                let dispatchable = match state.deferred_push_requests.get(&dest).and_then(|q| q.front()) {
                    Some(front) => Self::can_dispatch(&state, &self.config, &dest, front),
                    None => false,
                };
                if !dispatchable {
                    break;
                }
                let req = state
                    .deferred_push_requests
                    .get_mut(&dest)
                    .and_then(|q| q.pop_front())
                    .expect("front existed a moment ago");
                self.send_request(&mut state, req);
            }
        }
        state.deferred_push_requests.retain(|_, q| !q.is_empty());

        while !state.stop_pushing {
            let req = match state.push_requests.pop_front() {
                Some(r) => r,
                None => break,
            };
            let dest = req.destination.clone();
            if state.unreachable_block_mgrs.contains(&dest) {
                continue; // connect blackout persists for the pusher's lifetime.
            }
            if Self::can_dispatch(&state, &self.config, &dest, &req) {
                self.send_request(&mut state, req);
            } else {
                state.deferred_push_requests.entry(dest).or_default().push_back(req);
            }
        }
    }

    /// §4.E "sendRequest": bump counters, slice the already-loaded data
    /// file into per-block sub-buffers without re-reading it, dispatch to
    /// the transport. Must be called with `state` already locked.
    fn send_request(&self, state: &mut PusherState, req: PushRequest) {
        let request_id = state.next_request_id;
        state.next_request_id += 1;
        let dest = req.destination.clone();
        let size = req.size();
        let block_count = req.blocks.len() as u32;

        state.bytes_in_flight += size;
        state.reqs_in_flight += 1;
        *state.blocks_in_flight.entry(dest.clone()).or_insert(0) += block_count;

        let mut remaining = HashSet::with_capacity(req.blocks.len());
        let mut block_ids = Vec::with_capacity(req.blocks.len());
        let mut buffers = Vec::with_capacity(req.blocks.len());
        let mut cursor = req.req_buffer.offset;
        for (block_id, block_size) in &req.blocks {
            let id_string = block_id.to_string();
            remaining.insert(id_string.clone());
            state.block_to_request.insert(id_string.clone(), (dest.clone(), request_id));
            buffers.push(ManagedBuffer::slice(self.data.clone(), cursor as usize, *block_size as usize));
            block_ids.push(id_string);
            cursor += block_size;
        }
        state.request_remaining.insert(request_id, remaining);

        let listener: Arc<dyn PushResultListener> = Arc::new(PusherListener {
            pusher: self.self_arc(),
        });

        // Open a capture slot so a transport that resolves synchronously,
        // on this same thread, lands its outcome here instead of racing
        // the thread pool for `self.inner`'s lock (already held by our
        // caller). Anything left unresolved after `push_blocks` returns
        // is genuinely asynchronous and goes through the normal listener
        // path in `PusherListener`.
        INLINE_CAPTURE.with(|cell| *cell.borrow_mut() = Some(Vec::new()));
        self.transport.push_blocks(&dest, &block_ids, &buffers, listener);
        let inline_outcomes = INLINE_CAPTURE.with(|cell| cell.borrow_mut().take()).unwrap_or_default();
        for (block_id, bytes_pushed, failure) in inline_outcomes {
            Self::apply_outcome(state, &block_id, bytes_pushed, failure);
        }
    }

    /// §4.E "updateStateAndCheckIfPushMore": returns whether the pusher
    /// should immediately try to dispatch more work.
    pub fn update_state_and_check_if_push_more(
        &self,
        block_id: &str,
        bytes_pushed: u64,
        failure: Option<PushFailureClass>,
    ) -> bool {
        let mut state = self.inner.lock();
        Self::apply_outcome(&mut state, block_id, bytes_pushed, failure)
    }

    /// The bookkeeping itself, factored out so [`Self::send_request`] can
    /// apply an outcome it captured inline without re-locking `state` it
    /// already holds exclusively.
    fn apply_outcome(
        state: &mut PusherState,
        block_id: &str,
        bytes_pushed: u64,
        failure: Option<PushFailureClass>,
    ) -> bool {
        let (dest, request_id) = match state.block_to_request.remove(block_id) {
            Some(v) => v,
            None => return false, // already resolved, e.g. dropped by a connect blackout sweep.
        };
        state.bytes_in_flight = state.bytes_in_flight.saturating_sub(bytes_pushed);
        if let Some(count) = state.blocks_in_flight.get_mut(&dest) {
            *count = count.saturating_sub(1);
        }

        let mut request_done = false;
        if let Some(remaining) = state.request_remaining.get_mut(&request_id) {
            remaining.remove(block_id);
            if remaining.is_empty() {
                state.request_remaining.remove(&request_id);
                state.reqs_in_flight = state.reqs_in_flight.saturating_sub(1);
                request_done = true;
            }
        }

        match failure {
            Some(PushFailureClass::Connect) => {
                if state.unreachable_block_mgrs.insert(dest.clone()) {
                    let before = state.push_requests.len();
                    state.push_requests.retain(|r| r.destination != dest);
                    let dropped_main = before - state.push_requests.len();
                    let dropped_deferred = state
                        .deferred_push_requests
                        .remove(&dest)
                        .map(|q| q.len())
                        .unwrap_or(0);
                    log::warn!(
                        "destination {dest} unreachable, dropped {} queued push requests",
                        dropped_main + dropped_deferred
                    );
                }
                false
            }
            Some(PushFailureClass::MergeFinalized) => {
                state.stop_pushing = true;
                false
            }
            Some(PushFailureClass::Transient) | None => {
                request_done && (!state.push_requests.is_empty() || !state.deferred_push_requests.is_empty())
            }
        }
    }
}

struct PusherListener {
    pusher: Arc<ShuffleBlockPusher>,
}

impl PushResultListener for PusherListener {
    fn on_block_push_success(&self, block_id: &str, bytes_pushed: u64) {
        if try_capture_inline(block_id, bytes_pushed, None) {
            return;
        }
        let pusher = self.pusher.clone();
        let block_id = block_id.to_string();
        pusher.thread_pool.clone().submit(move || {
            if pusher.update_state_and_check_if_push_more(&block_id, bytes_pushed, None) {
                pusher.push_up_to_max();
            }
        });
    }

    fn on_block_push_failure(&self, block_id: &str, error: &ShuffleCoreError) {
        let class = PushFailureClass::classify(error);
        if !class_is_recoverable_local(error) {
            log::warn!("push failed for block {block_id}: {error}");
        }
        if try_capture_inline(block_id, 0, Some(class)) {
            return;
        }
        let pusher = self.pusher.clone();
        let block_id = block_id.to_string();
        pusher.thread_pool.clone().submit(move || {
            if pusher.update_state_and_check_if_push_more(&block_id, 0, Some(class)) {
                pusher.push_up_to_max();
            }
        });
    }
}

/// Appends to the current thread's inline-capture slot if one is open
/// (meaning we're a synchronous transport callback still nested inside
/// [`ShuffleBlockPusher::send_request`] on this very thread). Returns
/// `true` if captured — the caller must not also submit to the thread
/// pool, or the outcome would be applied twice.
fn try_capture_inline(block_id: &str, bytes_pushed: u64, failure: Option<PushFailureClass>) -> bool {
    INLINE_CAPTURE.with(|cell| match cell.borrow_mut().as_mut() {
        Some(outcomes) => {
            outcomes.push((block_id.to_string(), bytes_pushed, failure));
            true
        }
        None => false,
    })
}

fn class_is_recoverable_local(error: &ShuffleCoreError) -> bool {
    error.is_recoverable_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_id::BlockId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn merger(name: &str) -> BlockManagerId {
        BlockManagerId::new(name, format!("host-{name}"), 9000)
    }

    struct RecordingTransport {
        pushed: Mutex<Vec<(BlockManagerId, Vec<String>)>>,
        fail_destinations: HashSet<BlockManagerId>,
    }

    impl PushTransport for RecordingTransport {
        fn push_blocks(
            &self,
            destination: &BlockManagerId,
            block_ids: &[String],
            buffers: &[ManagedBuffer],
            listener: Arc<dyn PushResultListener>,
        ) {
            self.pushed.lock().push((destination.clone(), block_ids.to_vec()));
            if self.fail_destinations.contains(destination) {
                for block_id in block_ids {
                    listener.on_block_push_failure(
                        block_id,
                        &ShuffleCoreError::ConnectError {
                            location: destination.clone(),
                            reason: "refused".to_string(),
                        },
                    );
                }
            } else {
                for (block_id, buffer) in block_ids.iter().zip(buffers) {
                    listener.on_block_push_success(block_id, buffer.len() as u64);
                }
            }
        }
    }

    #[test]
    fn successful_push_drains_all_requests() {
        let data = Arc::new(vec![0u8; 1024]);
        let transport = Arc::new(RecordingTransport {
            pushed: Mutex::new(Vec::new()),
            fail_destinations: HashSet::new(),
        });
        let pool = PushThreadPool::new(2);
        let pusher = ShuffleBlockPusher::new(
            10,
            5,
            &[10, 20, 30],
            data,
            vec![merger("m0")],
            ShuffleCoreConfig::default(),
            transport.clone(),
            pool.clone(),
        );
        pusher.initiate_block_push();
        // thread pool callbacks run asynchronously; give them a moment.
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(pusher.is_finished());
        assert_eq!(pusher.bytes_in_flight(), 0);
        pool.shutdown();
    }

    #[test]
    fn connect_failure_blacks_out_destination() {
        let data = Arc::new(vec![0u8; 1024]);
        let mut fail = HashSet::new();
        fail.insert(merger("m0"));
        let transport = Arc::new(RecordingTransport {
            pushed: Mutex::new(Vec::new()),
            fail_destinations: fail,
        });
        let pool = PushThreadPool::new(2);
        let pusher = ShuffleBlockPusher::new(
            10,
            5,
            &[10, 20],
            data,
            vec![merger("m0")],
            ShuffleCoreConfig::default().max_block_batch_size(10), // force two separate requests
            transport.clone(),
            pool.clone(),
        );
        pusher.initiate_block_push();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(pusher.unreachable_destinations().contains(&merger("m0")));
        pool.shutdown();
    }

    #[test]
    fn second_request_to_a_failing_destination_is_never_sent() {
        // Two push requests queued for the same destination. The first
        // send fails with a connect error; the second must be dropped
        // from the queue before the dispatch loop ever reaches it.
        let data = Arc::new(vec![0u8; 1024]);
        let mut fail = HashSet::new();
        fail.insert(merger("m0"));
        let transport = Arc::new(RecordingTransport {
            pushed: Mutex::new(Vec::new()),
            fail_destinations: fail,
        });
        let pool = PushThreadPool::new(2);
        let pusher = ShuffleBlockPusher::new(
            10,
            5,
            &[10, 20],
            data,
            vec![merger("m0")],
            ShuffleCoreConfig::default().max_block_batch_size(10), // force two separate requests
            transport.clone(),
            pool.clone(),
        );
        pusher.initiate_block_push();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(pusher.unreachable_destinations().contains(&merger("m0")));
        assert_eq!(
            transport.pushed.lock().len(),
            1,
            "second request to the blacked-out destination must never reach the transport"
        );
        pool.shutdown();
    }

    #[test]
    fn classify_maps_error_variants_to_failure_classes() {
        let connect = ShuffleCoreError::ConnectError {
            location: merger("m0"),
            reason: "x".into(),
        };
        let finalized = ShuffleCoreError::MergeFinalized { location: merger("m0") };
        let transient = ShuffleCoreError::TransientPushError {
            block_id: BlockId::Shuffle { shuffle_id: 1, map_id: 1, reduce_id: 1 }.to_string(),
            location: merger("m0"),
            reason: "x".into(),
        };
        assert_eq!(PushFailureClass::classify(&connect), PushFailureClass::Connect);
        assert_eq!(PushFailureClass::classify(&finalized), PushFailureClass::MergeFinalized);
        assert_eq!(PushFailureClass::classify(&transient), PushFailureClass::Transient);
    }

    #[test]
    fn thread_pool_runs_submitted_jobs() {
        let pool = PushThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }
}
