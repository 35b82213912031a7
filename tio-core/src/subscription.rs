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

//! `storage_id -> {subscribers}` plus the snapshot state machine (§4.5).
//! Subscriptions hold a `Weak<Session>` rather than an `Arc` so a dead
//! connection's resources aren't kept alive by the table (design note:
//! "weak session references").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use crate::container::Container;
use crate::event_bus::EventInfo;
use crate::session::Session;

/// Pending -> Streaming -> Live, modeled explicitly rather than as an
/// implicit suspended control flow (design note: "coroutine-like snapshot
/// streaming"). `Streaming` isn't tracked as its own atomic state here;
/// `snapshot_pending` covers Pending+Streaming (the caller driving the
/// snapshot task is what distinguishes them) and clearing it transitions
/// straight to Live.
pub struct SubscriptionInfo {
    pub handle: u32,
    pub session: Weak<Session>,
    pub container: Container,
    pub start_spec: String,
    pub last_rev_num: AtomicU64,
    pub snapshot_pending: AtomicBool,
    pub tombstoned: AtomicBool,
    pending_live: Mutex<Vec<EventInfo>>,
}

impl SubscriptionInfo {
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::SeqCst)
    }

    pub fn tombstone(&self) {
        self.tombstoned.store(true, Ordering::SeqCst);
    }

    /// Buffers a live event if the snapshot is still in flight; returns
    /// `false` (and buffers nothing) once the snapshot has handed off to
    /// live, so the caller delivers it through the normal live path
    /// instead. Checking `snapshot_pending` and pushing happen under the
    /// same lock as `finish_snapshot`'s drain-and-flip, so there's no
    /// window where an event can be buffered after the drain already ran
    /// and then never delivered.
    pub fn buffer_pending_if_snapshotting(&self, event: EventInfo) -> bool {
        let mut buf = self.pending_live.lock().expect("subscription lock poisoned");
        if !self.snapshot_pending.load(Ordering::SeqCst) {
            return false;
        }
        buf.push(event);
        true
    }

    /// Drains whatever live events were buffered during the snapshot and
    /// flips `snapshot_pending` to false, atomically with respect to
    /// `buffer_pending_if_snapshotting` (§4.5 step 4: the snapshot->live
    /// handoff must not drop or duplicate events).
    pub fn finish_snapshot(&self) -> Vec<EventInfo> {
        let mut buf = self.pending_live.lock().expect("subscription lock poisoned");
        self.snapshot_pending.store(false, Ordering::SeqCst);
        std::mem::take(&mut *buf)
    }

    pub fn bump_rev(&self) -> u64 {
        self.last_rev_num.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<HashMap<u64, Vec<std::sync::Arc<SubscriptionInfo>>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new subscription for `container` on behalf of `session`.
    /// `snapshot_pending` starts true unless `start_spec` is empty (live
    /// only, no snapshot — step 2 of §4.5's `Subscribe`).
    pub fn subscribe(
        &self,
        handle: u32,
        session: Weak<Session>,
        container: Container,
        start_spec: String,
    ) -> std::sync::Arc<SubscriptionInfo> {
        let snapshot_pending = !start_spec.is_empty();
        let info = std::sync::Arc::new(SubscriptionInfo {
            handle,
            session,
            container: container.clone(),
            start_spec,
            last_rev_num: AtomicU64::new(0),
            snapshot_pending: AtomicBool::new(snapshot_pending),
            tombstoned: AtomicBool::new(false),
            pending_live: Mutex::new(Vec::new()),
        });
        self.inner
            .lock()
            .expect("subscription table lock poisoned")
            .entry(container.storage_id)
            .or_default()
            .push(info.clone());
        info
    }

    /// Returns the existing, non-tombstoned subscription for `handle` on
    /// `storage_id`, if any — used to detect the idempotent-resubscribe
    /// case (testable property 4).
    pub fn find(&self, storage_id: u64, handle: u32) -> Option<std::sync::Arc<SubscriptionInfo>> {
        self.inner
            .lock()
            .expect("subscription table lock poisoned")
            .get(&storage_id)
            .into_iter()
            .flatten()
            .find(|s| s.handle == handle && !s.is_tombstoned())
            .cloned()
    }

    /// Marks `handle`'s subscription (if any) on `storage_id` as
    /// tombstoned; the Publisher removes it lazily on its next sweep.
    pub fn unsubscribe(&self, storage_id: u64, handle: u32) {
        if let Some(subs) = self.inner.lock().expect("subscription table lock poisoned").get(&storage_id) {
            for s in subs {
                if s.handle == handle {
                    s.tombstone();
                }
            }
        }
    }

    /// Copies out the subscriber list for `storage_id`, dropping
    /// tombstoned entries in the same pass (invariant 6: lazy removal on
    /// next dispatch attempt).
    pub fn subscribers_for(&self, storage_id: u64) -> Vec<std::sync::Arc<SubscriptionInfo>> {
        let mut inner = self.inner.lock().expect("subscription table lock poisoned");
        if let Some(subs) = inner.get_mut(&storage_id) {
            subs.retain(|s| !s.is_tombstoned() && s.session.upgrade().map(|sess| sess.is_alive()).unwrap_or(false));
            subs.clone()
        } else {
            Vec::new()
        }
    }
}

/// Resolves a subscription's `start_spec` against the container's current
/// length into a starting position, or `None` meaning "no snapshot at
/// all" (only reachable when `start_spec` is empty, i.e. never called in
/// that case by callers that already short-circuit on it). Map containers
/// ignore any non-empty spec other than `"0"`, always starting a full
/// snapshot from position 0 (§4.2).
pub fn resolve_start_position(start_spec: &str, is_list: bool, count: u64) -> u64 {
    if start_spec.is_empty() {
        return 0;
    }
    if !is_list && start_spec != "0" {
        return 0;
    }
    match start_spec.parse::<i64>() {
        Ok(n) if n >= 0 => (n as u64).min(count),
        Ok(n) => {
            let magnitude = n.unsigned_abs();
            if magnitude >= count {
                0
            } else {
                count - magnitude
            }
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_spec_starts_at_zero() {
        assert_eq!(resolve_start_position("", true, 100), 0);
    }

    #[test]
    fn zero_spec_starts_at_zero() {
        assert_eq!(resolve_start_position("0", true, 100), 0);
    }

    #[test]
    fn positive_spec_is_absolute_position() {
        assert_eq!(resolve_start_position("10", true, 100), 10);
    }

    #[test]
    fn positive_spec_clamps_to_count() {
        assert_eq!(resolve_start_position("1000", true, 100), 100);
    }

    #[test]
    fn negative_spec_is_tail_relative() {
        assert_eq!(resolve_start_position("-1", true, 10), 9);
    }

    #[test]
    fn negative_spec_larger_than_count_clamps_to_zero() {
        assert_eq!(resolve_start_position("-1000", true, 10), 0);
    }

    #[test]
    fn map_ignores_non_zero_spec() {
        assert_eq!(resolve_start_position("5", false, 100), 0);
        assert_eq!(resolve_start_position("-5", false, 100), 0);
        assert_eq!(resolve_start_position("0", false, 100), 0);
    }

    fn event(n: i64) -> EventInfo {
        EventInfo {
            storage_id: 1,
            event_code: tio_protocol::wire::EventCode::Set,
            k: tio_protocol::Value::None,
            v: tio_protocol::Value::Int(n),
            m: tio_protocol::Value::None,
        }
    }

    /// A live event buffered right up to the snapshot/live handoff must
    /// still be delivered exactly once by `finish_snapshot`, never
    /// silently dropped by a later buffer attempt that lost the race.
    #[test]
    fn event_buffered_during_handoff_is_not_lost() {
        let info = std::sync::Arc::new(SubscriptionInfo {
            handle: 1,
            session: Weak::new(),
            container: crate::container::Container {
                storage_id: 1,
                name: "c".to_string(),
                backend: std::sync::Arc::new(crate::container::VolatileMap::new(1)),
            },
            start_spec: "0".to_string(),
            last_rev_num: AtomicU64::new(0),
            snapshot_pending: AtomicBool::new(true),
            tombstoned: AtomicBool::new(false),
            pending_live: Mutex::new(Vec::new()),
        });

        assert!(info.buffer_pending_if_snapshotting(event(1)));
        let drained = info.finish_snapshot();
        assert_eq!(drained.len(), 1);

        // Once finish_snapshot has flipped the flag, further events must
        // take the live path instead of being buffered (and lost).
        assert!(!info.buffer_pending_if_snapshotting(event(2)));
        assert!(info.finish_snapshot().is_empty());
    }
}
