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

//! Background dispatcher from the EventBus to subscribers (§4.4). Runs on
//! its own thread; every callback into Session from the backend event
//! path happens here (design note: "a single event bus as the only path
//! from backend -> sessions").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tio_protocol::Record;

use crate::applog::AppendLog;
use crate::event_bus::{EventBus, EventInfo};
use crate::subscription::SubscriptionTable;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

pub struct Publisher {
    event_bus: Arc<EventBus>,
    subscriptions: Arc<SubscriptionTable>,
    applog: Option<Arc<AppendLog>>,
    batch_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(
        event_bus: Arc<EventBus>,
        subscriptions: Arc<SubscriptionTable>,
        applog: Option<Arc<AppendLog>>,
        batch_size: usize,
    ) -> Self {
        Publisher { event_bus, subscriptions, applog, batch_size, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("tio-publisher".into())
            .spawn(move || self.run())
            .expect("failed to spawn publisher thread")
    }

    fn run(&self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let batch = self.event_bus.drain_batch(self.batch_size, DRAIN_TIMEOUT);
            if batch.is_empty() {
                continue;
            }
            for event in &batch {
                self.dispatch_one(event);
            }
            if let Some(log) = &self.applog {
                log.flush();
            }
        }
    }

    fn dispatch_one(&self, event: &EventInfo) {
        let subs = self.subscriptions.subscribers_for(event.storage_id);
        for sub in subs {
            let Some(session) = sub.session.upgrade() else { continue };
            if !session.is_alive() {
                continue;
            }
            if sub.buffer_pending_if_snapshotting(event.clone()) {
                continue;
            }
            // last_rev_num tracks delivery order for this subscription;
            // neither wire format places a revision number on an event
            // frame, so the bump is bookkeeping only.
            let _rev = sub.bump_rev();
            let record = Record::new(event.k.clone(), event.v.clone(), event.m.clone());
            let frame_bytes = crate::codec::encode_event_frame(session.protocol_mode(), sub.handle, event.event_code.as_str(), Some(&record));
            if !session.enqueue_outbound(frame_bytes) {
                tracing::warn!(session_id = session.id, "slow consumer, marking session for teardown");
                session.mark_dead();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::{ProtocolMode, Session};
    use std::sync::Arc;
    use tio_protocol::wire::EventCode;
    use tio_protocol::Value;

    #[test]
    fn live_event_reaches_outbound_queue() {
        let bus = Arc::new(EventBus::new());
        let subs = Arc::new(SubscriptionTable::new());
        let publisher = Publisher::new(bus.clone(), subs.clone(), None, 16);
        let shutdown = publisher.shutdown_handle();

        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);
        let info = subs.subscribe(1, Arc::downgrade(&session), test_container(), "".to_string());
        info.snapshot_pending.store(false, std::sync::atomic::Ordering::SeqCst);

        bus.push(EventInfo { storage_id: 42, event_code: EventCode::Set, k: Value::None, v: Value::Int(1), m: Value::None });

        let handle = std::thread::spawn(move || publisher.run());
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.join();

        assert!(String::from_utf8_lossy(&received).starts_with("event 1 set"));
    }

    fn test_container() -> crate::container::Container {
        crate::container::Container {
            storage_id: 42,
            name: "c1".to_string(),
            backend: Arc::new(crate::container::VolatileMap::new(42)),
        }
    }
}
