// Copyright 2024 Tio contributors
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

//! Per-connection state: the socket's protocol mode, the session-local
//! handle table, and the bounded outbound queue a dedicated writer thread
//! drains. One `Session` per accepted TCP connection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::codec::Frame;
use crate::container::Container;
use crate::error::{TioError, TioResult};
use crate::subscription::SubscriptionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Text,
    Binary,
    HttpOneShot,
}

struct HandleEntry {
    container: Container,
    subscription: Option<Arc<SubscriptionInfo>>,
}

/// Per-session command queue backing [`Session::enqueue_command`]/
/// [`Session::next_command_or_idle`]: `queue` and `running` share one
/// lock so "is a dispatch already in flight" and "queue this frame" are
/// one atomic decision — the race that would otherwise drop a frame
/// between a drain loop going idle and a new frame arriving can't happen.
#[derive(Default)]
struct DispatchQueue {
    queue: VecDeque<Frame>,
    running: bool,
}

pub struct Session {
    pub id: u32,
    protocol_mode: RwLock<ProtocolMode>,
    handles: RwLock<HashMap<u32, HandleEntry>>,
    next_handle: AtomicU32,
    outbound_tx: Sender<Vec<u8>>,
    authenticated_user: RwLock<Option<String>>,
    alive: AtomicBool,
    high_watermark: usize,
    dispatch_queue: Mutex<DispatchQueue>,
}

impl Session {
    /// `capacity` is the outbound queue's bound, in messages; once a
    /// `send` would exceed it the session is judged a slow consumer and
    /// `send` reports the overflow so the caller can tear the session
    /// down (§5 Backpressure). Returns the paired receiver for the
    /// writer thread to drain.
    pub fn new(id: u32, protocol_mode: ProtocolMode, high_watermark: usize) -> (Arc<Self>, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let session = Arc::new(Session {
            id,
            protocol_mode: RwLock::new(protocol_mode),
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            outbound_tx: tx,
            authenticated_user: RwLock::new(None),
            alive: AtomicBool::new(true),
            high_watermark,
            dispatch_queue: Mutex::new(DispatchQueue::default()),
        });
        (session, rx)
    }

    /// Queues `frame` for serialized dispatch (Ordering guarantee 2, §5:
    /// "within one session, total order over all outbound messages"). The
    /// server posts one frame at a time to the shared worker pool per
    /// session rather than one job per frame, so two frames read off the
    /// same connection in quick succession (e.g. a `wait_and_pop_next`
    /// immediately followed by a `ping`) can never have their answers land
    /// on different worker threads and race each other onto the outbound
    /// queue out of order.
    ///
    /// Returns `Some(frame)` if no dispatch is currently running for this
    /// session — the caller is responsible for dispatching it (and
    /// draining the queue via `next_command_or_idle` afterwards). Returns
    /// `None` if a dispatch is already in flight; that running drain loop
    /// will pick this frame up in order.
    pub fn enqueue_command(&self, frame: Frame) -> Option<Frame> {
        let mut state = self.dispatch_queue.lock().expect("session lock poisoned");
        if state.running {
            state.queue.push_back(frame);
            None
        } else {
            state.running = true;
            Some(frame)
        }
    }

    /// Called by the drain loop after dispatching one frame: pops the next
    /// queued frame, or marks the session idle if none is waiting. Done
    /// under the same lock `enqueue_command` uses so a frame arriving
    /// concurrently with the queue going empty is never stranded.
    pub fn next_command_or_idle(&self) -> Option<Frame> {
        let mut state = self.dispatch_queue.lock().expect("session lock poisoned");
        match state.queue.pop_front() {
            Some(frame) => Some(frame),
            None => {
                state.running = false;
                None
            }
        }
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        *self.protocol_mode.read().expect("session lock poisoned")
    }

    pub fn set_protocol_mode(&self, mode: ProtocolMode) {
        *self.protocol_mode.write().expect("session lock poisoned") = mode;
    }

    pub fn authenticated_user(&self) -> Option<String> {
        self.authenticated_user.read().expect("session lock poisoned").clone()
    }

    pub fn set_authenticated_user(&self, user: Option<String>) {
        *self.authenticated_user.write().expect("session lock poisoned") = user;
    }

    /// Allocates the next handle for `container`, unless `container` is
    /// already registered under an existing handle, in which case that
    /// handle is reused (open question in §9, tightened to always reuse).
    pub fn register_container(&self, container: Container) -> u32 {
        let mut handles = self.handles.write().expect("session lock poisoned");
        if let Some((&handle, _)) = handles.iter().find(|(_, e)| e.container.storage_id == container.storage_id) {
            return handle;
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        handles.insert(handle, HandleEntry { container, subscription: None });
        handle
    }

    pub fn resolve_handle(&self, handle: u32) -> TioResult<Container> {
        self.handles
            .read()
            .expect("session lock poisoned")
            .get(&handle)
            .map(|e| e.container.clone())
            .ok_or(TioError::BadHandle(handle))
    }

    pub fn attach_subscription(&self, handle: u32, subscription: Arc<SubscriptionInfo>) {
        if let Some(entry) = self.handles.write().expect("session lock poisoned").get_mut(&handle) {
            entry.subscription = Some(subscription);
        }
    }

    pub fn subscription_for(&self, handle: u32) -> Option<Arc<SubscriptionInfo>> {
        self.handles.read().expect("session lock poisoned").get(&handle).and_then(|e| e.subscription.clone())
    }

    /// Removes `handle`'s mapping, returning its subscription (if any) so
    /// the caller can tombstone it in the SubscriptionTable.
    pub fn close_handle(&self, handle: u32) -> Option<Arc<SubscriptionInfo>> {
        self.handles.write().expect("session lock poisoned").remove(&handle).and_then(|e| e.subscription)
    }

    /// Drops `handle`'s subscription without closing the handle itself
    /// (the `unsubscribe` command, as distinct from `close`). Returns the
    /// subscription that was attached, if any, so the caller can tombstone
    /// it in the SubscriptionTable.
    pub fn clear_subscription(&self, handle: u32) -> Option<Arc<SubscriptionInfo>> {
        self.handles.write().expect("session lock poisoned").get_mut(&handle).and_then(|e| e.subscription.take())
    }

    pub fn handle_count(&self) -> usize {
        self.handles.read().expect("session lock poisoned").len()
    }

    pub fn list_handles(&self) -> Vec<(u32, String, u64)> {
        self.handles
            .read()
            .expect("session lock poisoned")
            .iter()
            .map(|(&h, e)| (h, e.container.name.clone(), e.container.storage_id))
            .collect()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Enqueues an already-encoded outbound frame. Returns `false` if the
    /// queue has crossed the high watermark, in which case the caller
    /// (Publisher or dispatcher) should disconnect this session as a slow
    /// consumer; the frame is still enqueued so earlier answers aren't
    /// lost mid-teardown.
    pub fn enqueue_outbound(&self, frame: Vec<u8>) -> bool {
        if !self.is_alive() {
            return true;
        }
        match self.outbound_tx.try_send(frame) {
            Ok(()) => self.outbound_tx.len() < self.high_watermark,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound_tx.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::{ContainerBackend, VolatileList};

    fn fixture_container(name: &str, storage_id: u64) -> Container {
        Container { storage_id, name: name.to_string(), backend: Arc::new(VolatileList::new(storage_id)) }
    }

    #[test]
    fn register_container_allocates_dense_handles() {
        let (session, _rx) = Session::new(1, ProtocolMode::Text, 1024);
        let h1 = session.register_container(fixture_container("a", 1));
        let h2 = session.register_container(fixture_container("b", 2));
        assert_eq!(h1, 1);
        assert_eq!(h2, 2);
    }

    #[test]
    fn re_registering_same_container_reuses_handle() {
        let (session, _rx) = Session::new(1, ProtocolMode::Text, 1024);
        let c = fixture_container("a", 1);
        let h1 = session.register_container(c.clone());
        let h2 = session.register_container(c);
        assert_eq!(h1, h2);
    }

    #[test]
    fn resolve_unknown_handle_errors() {
        let (session, _rx) = Session::new(1, ProtocolMode::Text, 1024);
        assert_eq!(session.resolve_handle(99), Err(TioError::BadHandle(99)));
    }

    #[test]
    fn close_handle_returns_its_subscription() {
        let (session, _rx) = Session::new(1, ProtocolMode::Text, 1024);
        let c = fixture_container("a", 1);
        let h = session.register_container(c);
        assert!(session.close_handle(h).is_none());
        assert!(session.resolve_handle(h).is_err());
    }

    #[test]
    fn enqueue_after_mark_dead_is_a_noop_success() {
        let (session, _rx) = Session::new(1, ProtocolMode::Text, 1024);
        session.mark_dead();
        assert!(session.enqueue_outbound(b"x".to_vec()));
    }
}
