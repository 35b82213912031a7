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

//! The single MPSC queue decoupling container mutations from subscriber
//! fan-out. Modeled directly on the condvar-gated slot in shpool's
//! `ExitNotifier`, generalized from "one slot" to "a FIFO of slots" since
//! many events can be pending at once.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tio_protocol::wire::EventCode;
use tio_protocol::Value;

#[derive(Debug, Clone)]
pub struct EventInfo {
    pub storage_id: u64,
    pub event_code: EventCode,
    pub k: Value,
    pub v: Value,
    pub m: Value,
}

struct Inner {
    queue: VecDeque<EventInfo>,
}

pub struct EventBus {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus { inner: Mutex::new(Inner { queue: VecDeque::new() }), cond: Condvar::new() }
    }

    /// Non-blocking; wakes one waiting Publisher.
    pub fn push(&self, event: EventInfo) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.queue.push_back(event);
        self.cond.notify_one();
    }

    /// Drains up to `max` events, blocking until at least one is
    /// available or `timeout` elapses. Returns an empty vec on timeout so
    /// the Publisher can check its shutdown flag between waits.
    pub fn drain_batch(&self, max: usize, timeout: Duration) -> Vec<EventInfo> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.queue.is_empty() {
            let (guard, _timed_out) = self
                .cond
                .wait_timeout_while(inner, timeout, |inner| inner.queue.is_empty())
                .expect("event bus lock poisoned");
            inner = guard;
        }
        let n = inner.queue.len().min(max);
        inner.queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event bus lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_drain_returns_event() {
        let bus = EventBus::new();
        bus.push(EventInfo { storage_id: 1, event_code: EventCode::Set, k: Value::None, v: Value::None, m: Value::None });
        let batch = bus.drain_batch(10, Duration::from_millis(50));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].storage_id, 1);
    }

    #[test]
    fn drain_respects_batch_cap() {
        let bus = EventBus::new();
        for i in 0..5 {
            bus.push(EventInfo { storage_id: i, event_code: EventCode::Clear, k: Value::None, v: Value::None, m: Value::None });
        }
        let batch = bus.drain_batch(2, Duration::from_millis(50));
        assert_eq!(batch.len(), 2);
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn drain_times_out_when_empty() {
        let bus = EventBus::new();
        let batch = bus.drain_batch(10, Duration::from_millis(20));
        assert!(batch.is_empty());
    }

    #[test]
    fn waiting_consumer_wakes_on_push() {
        let bus = Arc::new(EventBus::new());
        let bus2 = bus.clone();
        let handle = thread::spawn(move || bus2.drain_batch(10, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        bus.push(EventInfo { storage_id: 7, event_code: EventCode::PushBack, k: Value::None, v: Value::None, m: Value::None });
        let batch = handle.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].storage_id, 7);
    }
}
