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

//! Command name -> handler (§4.7). Pre-handler checks (ACL, handle
//! resolution) happen once in [`Dispatcher::dispatch`]; individual handlers
//! stay short and return a `TioResult<Option<Value>>` tail for
//! `Dispatcher::reply` to encode. Handlers that start an event stream
//! (`subscribe`, `group_subscribe`, `query`) reply first, then post the
//! streaming work to the worker pool, so the answer always precedes any
//! event it caused (ordering guarantee 4, §5).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tio_protocol::wire::field;
use tio_protocol::{Record, Value};

use crate::applog::AppendLog;
use crate::auth::AuthTable;
use crate::codec::{encode_answer_frame, encode_event_frame, Frame};
use crate::consts::{PROTOCOL_VERSION, WAIT_AND_POP_NEXT_POLL_INTERVAL_MS, WAIT_AND_POP_NEXT_TIMEOUT_MS};
use crate::container::Container;
use crate::error::{TioError, TioResult};
use crate::group::{GroupManager, SubscribeFn};
use crate::meta;
use crate::registry::ContainerRegistry;
use crate::session::Session;
use crate::subscription::{resolve_start_position, SubscriptionInfo, SubscriptionTable};
use crate::worker::WorkerPool;

pub struct Dispatcher {
    registry: Arc<ContainerRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    groups: Arc<GroupManager>,
    auth: Arc<AuthTable>,
    worker: Arc<WorkerPool>,
    applog: Option<Arc<AppendLog>>,
    snapshot_batch: usize,
    paused: Arc<AtomicBool>,
    next_query_id: AtomicU32,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        subscriptions: Arc<SubscriptionTable>,
        groups: Arc<GroupManager>,
        auth: Arc<AuthTable>,
        worker: Arc<WorkerPool>,
        applog: Option<Arc<AppendLog>>,
        snapshot_batch: usize,
    ) -> Self {
        Dispatcher {
            registry,
            subscriptions,
            groups,
            auth,
            worker,
            applog,
            snapshot_batch,
            paused: Arc::new(AtomicBool::new(false)),
            next_query_id: AtomicU32::new(1),
        }
    }

    /// Entry point called once per parsed command frame, always off the
    /// reader thread (posted to the worker pool by the server) so a slow or
    /// blocking handler never stalls a socket read.
    pub fn dispatch(&self, session: &Arc<Session>, frame: &Frame) {
        meta::record_last_command(&self.registry, session.id, &frame.command);

        if frame.command != "auth" && !self.check_access(session, frame) {
            self.reply(session, Err(TioError::AccessDenied));
            return;
        }
        if self.paused.load(Ordering::SeqCst) && crate::auth::is_write_command(&frame.command) {
            self.reply(session, Err(TioError::AccessDenied));
            return;
        }

        match frame.command.as_str() {
            "create" => self.handle_create(session, frame),
            "open" => self.handle_open(session, frame),
            "close" => self.handle_close(session, frame),
            "delete_container" => self.handle_delete_container(session, frame),
            "push_back" => self.handle_push(session, frame, true),
            "push_front" => self.handle_push(session, frame, false),
            "pop_back" => self.handle_pop(session, frame, true),
            "pop_front" => self.handle_pop(session, frame, false),
            "set" => self.handle_set(session, frame),
            "insert" => self.handle_insert(session, frame),
            "delete" => self.handle_delete(session, frame),
            "clear" => self.handle_clear(session, frame),
            "get" => self.handle_get(session, frame),
            "get_count" => self.handle_get_count(session, frame),
            "get_record_by_position" => self.handle_get_record_by_position(session, frame),
            "propset" => self.handle_propset(session, frame),
            "propget" => self.handle_propget(session, frame),
            "modify" => self.handle_modify(session, frame),
            "subscribe" => self.handle_subscribe(session, frame),
            "unsubscribe" => self.handle_unsubscribe(session, frame),
            "wait_and_pop_next" => self.handle_wait_and_pop_next(session, frame),
            "group_add" => self.handle_group_add(session, frame),
            "group_subscribe" => self.handle_group_subscribe(session, frame),
            "query" | "query_ex" => self.handle_query(session, frame),
            "list_handles" => self.handle_list_handles(session),
            "ping" => self.reply(session, Ok(None)),
            "version" => self.reply(session, Ok(Some(Value::String(PROTOCOL_VERSION.as_bytes().to_vec())))),
            "pause" => {
                self.paused.store(true, Ordering::SeqCst);
                self.reply(session, Ok(None));
            }
            "resume" => {
                self.paused.store(false, Ordering::SeqCst);
                self.reply(session, Ok(None));
            }
            "auth" => self.handle_auth(session, frame),
            "set_permission" => self.handle_set_permission(session, frame),
            other => self.reply(session, Err(TioError::BadCommand(format!("unknown command '{other}'")))),
        }
    }

    fn check_access(&self, session: &Arc<Session>, frame: &Frame) -> bool {
        let object = resolve_name(frame, 0).or_else(|| resolve_group(frame, 0)).unwrap_or_default();
        self.auth.check_object_access(session.authenticated_user().as_deref(), &object, &frame.command)
    }

    fn reply(&self, session: &Arc<Session>, result: TioResult<Option<Value>>) {
        let bytes = encode_answer_frame(session.protocol_mode(), &result);
        if !session.enqueue_outbound(bytes) {
            session.mark_dead();
        }
    }

    fn with_container<F>(&self, session: &Arc<Session>, frame: &Frame, f: F)
    where
        F: FnOnce(&Self, Container) -> TioResult<Option<Value>>,
    {
        let result = (|| {
            let handle = resolve_handle(frame)?;
            let container = session.resolve_handle(handle)?;
            f(self, container)
        })();
        self.reply(session, result);
    }

    fn log_mutation(&self, container: &Container, op: &str, k: &Value, v: &Value, m: &Value) {
        if let Some(log) = &self.applog {
            log.log_mutation(&container.name, op, k, v, m);
        }
    }

    fn ensure_applog_id(&self, name: &str, type_name: &str) {
        if let Some(log) = &self.applog {
            log.ensure_container_id(name, type_name);
        }
    }

    fn handle_create(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let name = resolve_name(frame, 0).ok_or_else(|| TioError::BadCommand("create: missing name".into()))?;
            let type_name = resolve_type(frame, 1).ok_or_else(|| TioError::BadCommand("create: missing type".into()))?;
            let container = self.registry.create_container(&type_name, &name)?;
            self.ensure_applog_id(&name, &type_name);
            let handle = session.register_container(container);
            Ok(Some(Value::Int(handle as i64)))
        })();
        self.reply(session, result);
    }

    fn handle_open(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let name = resolve_name(frame, 0).ok_or_else(|| TioError::BadCommand("open: missing name".into()))?;
            let type_name = resolve_type(frame, 1).unwrap_or_default();
            let container = self.registry.open_container(&type_name, &name)?;
            self.ensure_applog_id(&name, container.kind().as_str());
            let handle = session.register_container(container);
            Ok(Some(Value::Int(handle as i64)))
        })();
        self.reply(session, result);
    }

    fn handle_close(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let handle = resolve_handle(frame)?;
            if let Some(sub) = session.close_handle(handle) {
                self.subscriptions.unsubscribe(sub.container.storage_id, handle);
            }
            Ok(None)
        })();
        self.reply(session, result);
    }

    fn handle_delete_container(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let name = resolve_name(frame, 0).ok_or_else(|| TioError::BadCommand("delete_container: missing name".into()))?;
            self.registry.delete_container(&name)?;
            Ok(None)
        })();
        self.reply(session, result);
    }

    fn handle_push(&self, session: &Arc<Session>, frame: &Frame, back: bool) {
        self.with_container(session, frame, move |this, container| {
            let position = if back {
                container.backend.push_back(frame.value(), frame.metadata())?
            } else {
                container.backend.push_front(frame.value(), frame.metadata())?
            };
            this.log_mutation(&container, if back { "push_back" } else { "push_front" }, &position, &frame.value(), &frame.metadata());
            Ok(Some(position))
        });
    }

    fn handle_pop(&self, session: &Arc<Session>, frame: &Frame, back: bool) {
        self.with_container(session, frame, move |this, container| {
            let popped = if back { container.backend.pop_back()? } else { container.backend.pop_front()? };
            if let Some(record) = &popped {
                this.log_mutation(&container, if back { "pop_back" } else { "pop_front" }, &record.key, &record.value, &record.metadata);
            }
            Ok(popped.map(|r| r.value))
        });
    }

    fn handle_set(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |this, container| {
            let (key, value, metadata) = (frame.key(), frame.value(), frame.metadata());
            container.backend.set(key.clone(), value.clone(), metadata.clone())?;
            this.log_mutation(&container, "set", &key, &value, &metadata);
            Ok(None)
        });
    }

    fn handle_insert(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |this, container| {
            let (key, value, metadata) = (frame.key(), frame.value(), frame.metadata());
            container.backend.insert(key.clone(), value.clone(), metadata.clone())?;
            this.log_mutation(&container, "insert", &key, &value, &metadata);
            Ok(None)
        });
    }

    fn handle_modify(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |this, container| {
            let (key, value, metadata) = (frame.key(), frame.value(), frame.metadata());
            if container.backend.get(key.clone())?.is_none() {
                return Err(TioError::NotFound(key.to_string()));
            }
            container.backend.set(key.clone(), value.clone(), metadata.clone())?;
            this.log_mutation(&container, "modify", &key, &value, &metadata);
            Ok(None)
        });
    }

    fn handle_delete(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |this, container| {
            let key = resolve_key(frame, 1);
            container.backend.delete(key.clone())?;
            this.log_mutation(&container, "delete", &key, &Value::None, &Value::None);
            Ok(None)
        });
    }

    fn handle_clear(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |this, container| {
            container.backend.clear()?;
            this.log_mutation(&container, "clear", &Value::None, &Value::None, &Value::None);
            Ok(None)
        });
    }

    fn handle_get(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |_this, container| {
            let key = resolve_key(frame, 1);
            Ok(container.backend.get(key)?.map(|r| r.value))
        });
    }

    fn handle_get_count(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, |_this, container| Ok(Some(Value::Int(container.backend.get_count() as i64))));
    }

    fn handle_get_record_by_position(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |_this, container| {
            let position = resolve_position(frame, 1)?;
            Ok(container.backend.get_record_by_position(position)?.map(|r| r.value))
        });
    }

    fn handle_propset(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |_this, container| {
            container.backend.propset(frame.key(), frame.value())?;
            Ok(None)
        });
    }

    fn handle_propget(&self, session: &Arc<Session>, frame: &Frame) {
        self.with_container(session, frame, move |_this, container| {
            let key = resolve_key(frame, 1);
            Ok(container.backend.propget(key)?)
        });
    }

    /// Idempotent per testable property 4: re-subscribing the same
    /// (session, handle) with any start_spec is answered `ok` without a
    /// second snapshot.
    fn handle_subscribe(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| -> TioResult<Option<Arc<SubscriptionInfo>>> {
            let handle = resolve_handle(frame)?;
            let container = session.resolve_handle(handle)?;
            if let Some(existing) = self.subscriptions.find(container.storage_id, handle) {
                let _ = existing;
                return Ok(None);
            }
            let start = resolve_start(frame, 1);
            let info = self.subscriptions.subscribe(handle, Arc::downgrade(session), container, start);
            session.attach_subscription(handle, info.clone());
            Ok(Some(info))
        })();
        match result {
            Ok(maybe_new) => {
                self.reply(session, Ok(None));
                if let Some(info) = maybe_new {
                    if info.snapshot_pending.load(Ordering::SeqCst) {
                        let session = session.clone();
                        self.worker.post(move || run_snapshot(&session, &info));
                    }
                }
            }
            Err(e) => self.reply(session, Err(e)),
        }
    }

    fn handle_unsubscribe(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let handle = resolve_handle(frame)?;
            if let Some(sub) = session.clear_subscription(handle) {
                self.subscriptions.unsubscribe(sub.container.storage_id, handle);
            }
            Ok(None)
        })();
        self.reply(session, result);
    }

    /// Bounded poll on a worker thread (never the reactor): blocking here
    /// is safe precisely because the server posts every dispatch onto the
    /// worker pool before calling in.
    fn handle_wait_and_pop_next(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| -> TioResult<Option<Record>> {
            let handle = resolve_handle(frame)?;
            let container = session.resolve_handle(handle)?;
            let deadline = Instant::now() + Duration::from_millis(WAIT_AND_POP_NEXT_TIMEOUT_MS);
            loop {
                if let Some(record) = container.backend.pop_front()? {
                    self.log_mutation(&container, "pop_front", &record.key, &record.value, &record.metadata);
                    return Ok(Some(record));
                }
                if !session.is_alive() || Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(WAIT_AND_POP_NEXT_POLL_INTERVAL_MS));
            }
        })();
        self.reply(session, result.map(|r| r.map(|record| record.value)));
    }

    fn handle_group_add(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let group = resolve_group(frame, 0).ok_or_else(|| TioError::BadCommand("group_add: missing group".into()))?;
            let container_name = resolve_name(frame, 1).ok_or_else(|| TioError::BadCommand("group_add: missing container".into()))?;
            let container = self.registry.get(&container_name).ok_or_else(|| TioError::NotFound(container_name.clone()))?;
            self.groups.add_container(&group, container, &self.group_subscribe_fn())?;
            Ok(None)
        })();
        self.reply(session, result);
    }

    fn handle_group_subscribe(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let group = resolve_group(frame, 0).ok_or_else(|| TioError::BadCommand("group_subscribe: missing group".into()))?;
            let start = resolve_start(frame, 1);
            let mirror = self.groups.subscribe_group(session, &group, &start, &self.group_subscribe_fn())?;
            let handle = session.register_container(mirror);
            Ok(Some(Value::Int(handle as i64)))
        })();
        self.reply(session, result);
    }

    /// Builds the callback `GroupManager` uses to drive a session's normal
    /// subscription machinery for both retroactive (`add_container`) and
    /// initial (`subscribe_group`) membership, so there is exactly one code
    /// path that installs a per-container subscription.
    fn group_subscribe_fn(&self) -> Box<SubscribeFn> {
        let subscriptions = self.subscriptions.clone();
        let worker = self.worker.clone();
        Box::new(move |session: &Arc<Session>, container: &Container, start_spec: &str| {
            let handle = session.register_container(container.clone());
            let announce = encode_event_frame(session.protocol_mode(), handle, "group_container", None);
            if !session.enqueue_outbound(announce) {
                session.mark_dead();
                return;
            }
            if subscriptions.find(container.storage_id, handle).is_some() {
                return;
            }
            let info = subscriptions.subscribe(handle, Arc::downgrade(session), container.clone(), start_spec.to_string());
            session.attach_subscription(handle, info.clone());
            if info.snapshot_pending.load(Ordering::SeqCst) {
                let session = session.clone();
                worker.post(move || run_snapshot(&session, &info));
            }
        })
    }

    /// `query`/`query_ex` both materialize `[start, start+count)` of a
    /// container into a transient stream addressed by a query id fresh for
    /// this call (the distilled command set doesn't differentiate the two
    /// any further — see DESIGN.md).
    fn handle_query(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| -> TioResult<(Container, String, u64)> {
            let handle = resolve_handle(frame)?;
            let container = session.resolve_handle(handle)?;
            let start = resolve_start(frame, 1);
            let count = match frame.value().as_int() {
                Some(n) if n >= 0 => n as u64,
                _ => frame.args.get(2).and_then(|s| s.parse().ok()).unwrap_or(self.snapshot_batch as u64),
            };
            Ok((container, start, count))
        })();
        match result {
            Ok((container, start, count)) => {
                let query_id = self.next_query_id.fetch_add(1, Ordering::SeqCst);
                self.reply(session, Ok(Some(Value::Int(query_id as i64))));
                let session = session.clone();
                self.worker.post(move || run_query(&session, &container, &start, count, query_id));
            }
            Err(e) => self.reply(session, Err(e)),
        }
    }

    fn handle_list_handles(&self, session: &Arc<Session>) {
        self.reply(session, Ok(Some(Value::Int(session.handle_count() as i64))));
    }

    fn handle_auth(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let user = resolve_str(frame, field::CONTAINER_NAME, 0).ok_or_else(|| TioError::BadCommand("auth: missing user".into()))?;
            let password = resolve_str(frame, field::VALUE, 1).ok_or_else(|| TioError::BadCommand("auth: missing password".into()))?;
            self.auth.authenticate(&user, &password).ok_or(TioError::AccessDenied)
        })();
        match result {
            Ok(user) => {
                session.set_authenticated_user(Some(user.clone()));
                self.reply(session, Ok(Some(Value::String(user.into_bytes()))));
            }
            Err(e) => self.reply(session, Err(e)),
        }
    }

    /// `object`/`command`/`allow` don't have dedicated field ids in §4.1's
    /// table, so this reuses `CONTAINER_NAME`/`KEY`/`VALUE` (see DESIGN.md).
    fn handle_set_permission(&self, session: &Arc<Session>, frame: &Frame) {
        let result = (|| {
            let user = session.authenticated_user().ok_or(TioError::AccessDenied)?;
            let object = resolve_str(frame, field::CONTAINER_NAME, 0).ok_or_else(|| TioError::BadCommand("set_permission: missing object".into()))?;
            let command = resolve_str(frame, field::KEY, 1).ok_or_else(|| TioError::BadCommand("set_permission: missing command".into()))?;
            let allow = match frame.get(field::VALUE) {
                Some(Value::Int(i)) => *i != 0,
                _ => frame.args.get(2).map(|s| s == "true" || s == "1").unwrap_or(false),
            };
            self.auth.set_permission(&user, &object, &command, allow);
            Ok(None)
        })();
        self.reply(session, result);
    }
}

/// Streams a container's contents as synthetic `snapshot` events followed
/// by `snapshot_end`, then flushes whatever live events the Publisher
/// buffered while this ran (§4.5 step 4). Runs on a worker thread; aborts
/// as soon as the session dies.
fn run_snapshot(session: &Arc<Session>, info: &Arc<SubscriptionInfo>) {
    let is_list = info.container.kind().is_list();
    let count = info.container.backend.get_count();
    let mut position = resolve_start_position(&info.start_spec, is_list, count);
    loop {
        if !session.is_alive() {
            return;
        }
        match info.container.backend.get_record_by_position(position) {
            Ok(Some(record)) => {
                let frame = encode_event_frame(session.protocol_mode(), info.handle, "snapshot", Some(&record));
                if !session.enqueue_outbound(frame) {
                    session.mark_dead();
                    return;
                }
                position += 1;
            }
            _ => break,
        }
    }
    let end = encode_event_frame(session.protocol_mode(), info.handle, "snapshot_end", None);
    if !session.enqueue_outbound(end) {
        session.mark_dead();
        return;
    }
    for pending in info.finish_snapshot() {
        if !session.is_alive() {
            return;
        }
        let record = Record::new(pending.k, pending.v, pending.m);
        let frame = encode_event_frame(session.protocol_mode(), info.handle, pending.event_code.as_str(), Some(&record));
        if !session.enqueue_outbound(frame) {
            session.mark_dead();
            return;
        }
    }
}

fn run_query(session: &Arc<Session>, container: &Container, start_spec: &str, count: u64, query_id: u32) {
    let is_list = container.kind().is_list();
    let total = container.backend.get_count();
    let mut position = resolve_start_position(start_spec, is_list, total);
    let mut remaining = count;
    while remaining > 0 {
        if !session.is_alive() {
            return;
        }
        match container.backend.get_record_by_position(position) {
            Ok(Some(record)) => {
                let frame = encode_event_frame(session.protocol_mode(), query_id, "query_item", Some(&record));
                if !session.enqueue_outbound(frame) {
                    session.mark_dead();
                    return;
                }
                position += 1;
                remaining -= 1;
            }
            _ => break,
        }
    }
    let end = encode_event_frame(session.protocol_mode(), query_id, "query_end", None);
    if !session.enqueue_outbound(end) {
        session.mark_dead();
    }
}

fn resolve_handle(frame: &Frame) -> TioResult<u32> {
    frame
        .handle()
        .or_else(|| frame.args.first().and_then(|s| s.parse().ok()))
        .ok_or_else(|| TioError::BadCommand(format!("{}: missing handle", frame.command)))
}

fn resolve_name(frame: &Frame, idx: usize) -> Option<String> {
    frame.container_name().or_else(|| frame.args.get(idx).cloned())
}

fn resolve_type(frame: &Frame, idx: usize) -> Option<String> {
    frame.container_type().or_else(|| frame.args.get(idx).cloned())
}

fn resolve_group(frame: &Frame, idx: usize) -> Option<String> {
    frame.group_name().or_else(|| frame.args.get(idx).cloned())
}

fn resolve_start(frame: &Frame, idx: usize) -> String {
    let spec = frame.start_spec();
    if !spec.is_empty() {
        spec
    } else {
        frame.args.get(idx).cloned().unwrap_or_default()
    }
}

fn resolve_key(frame: &Frame, idx: usize) -> Value {
    if let Some(v) = frame.get(field::KEY) {
        return v.clone();
    }
    frame.args.get(idx).map(|s| parse_scalar_arg(s)).unwrap_or(Value::None)
}

fn resolve_position(frame: &Frame, idx: usize) -> TioResult<u64> {
    resolve_key(frame, idx).as_int().map(|n| n.max(0) as u64).ok_or(TioError::OutOfRange)
}

fn resolve_str(frame: &Frame, field_id: u16, idx: usize) -> Option<String> {
    match frame.get(field_id) {
        Some(Value::String(s)) => Some(String::from_utf8_lossy(s).to_string()),
        _ => frame.args.get(idx).cloned(),
    }
}

fn parse_scalar_arg(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(d) = s.parse::<f64>() {
        Value::Double(d)
    } else {
        Value::String(s.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::session::ProtocolMode;
    use std::collections::HashMap;

    fn new_dispatcher() -> (Dispatcher, Arc<ContainerRegistry>) {
        let registry = Arc::new(ContainerRegistry::new(Arc::new(EventBus::new())));
        let subscriptions = Arc::new(SubscriptionTable::new());
        let groups = Arc::new(GroupManager::new(registry.clone()));
        let auth = Arc::new(AuthTable::new(&HashMap::new(), false));
        let worker = Arc::new(WorkerPool::new(2));
        let dispatcher = Dispatcher::new(registry.clone(), subscriptions, groups, auth, worker, None, 64);
        (dispatcher, registry)
    }

    fn recv_all(rx: &crossbeam_channel::Receiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.recv_timeout(Duration::from_millis(500)) {
            out.push(String::from_utf8_lossy(&bytes).to_string());
            if out.last().map(|s| s.starts_with("event") && s.contains("snapshot_end")).unwrap_or(false) {
                break;
            }
        }
        out
    }

    #[test]
    fn create_then_push_back_answers_with_handle_and_position() {
        let (dispatcher, _registry) = new_dispatcher();
        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);

        let mut create = Frame::new("create");
        create.args = vec!["vl1".to_string(), "volatile_list".to_string()];
        dispatcher.dispatch(&session, &create);
        let answer = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(String::from_utf8_lossy(&answer), "answer ok 1\r\n");

        let mut push = Frame::new("push_back");
        push.args = vec!["1".to_string()];
        push.fields.insert(field::VALUE, Value::String(b"abc".to_vec()));
        push.fields.insert(field::METADATA, Value::None);
        dispatcher.dispatch(&session, &push);
        let answer = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(String::from_utf8_lossy(&answer), "answer ok 0\r\n");
    }

    #[test]
    fn subscribe_replies_before_snapshot_events_arrive() {
        let (dispatcher, registry) = new_dispatcher();
        let container = registry.create_container("volatile_list", "vl1").unwrap();
        container.backend.push_back(Value::Int(10), Value::None).unwrap();

        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);
        let handle = session.register_container(container);

        let mut subscribe = Frame::new("subscribe");
        subscribe.args = vec![handle.to_string(), "0".to_string()];
        dispatcher.dispatch(&session, &subscribe);

        let messages = recv_all(&rx);
        assert_eq!(messages[0], "answer ok\r\n");
        assert!(messages[1].starts_with("event 1 snapshot "));
        assert!(messages.last().unwrap().starts_with("event 1 snapshot_end"));
    }

    #[test]
    fn resubscribe_is_idempotent_and_skips_second_snapshot() {
        let (dispatcher, registry) = new_dispatcher();
        let container = registry.create_container("volatile_list", "vl1").unwrap();
        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);
        let handle = session.register_container(container);

        let mut subscribe = Frame::new("subscribe");
        subscribe.args = vec![handle.to_string(), "0".to_string()];
        dispatcher.dispatch(&session, &subscribe);
        let _ = recv_all(&rx);

        dispatcher.dispatch(&session, &subscribe);
        let answer = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(String::from_utf8_lossy(&answer), "answer ok\r\n");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn unknown_command_reports_bad_command() {
        let (dispatcher, _registry) = new_dispatcher();
        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);
        dispatcher.dispatch(&session, &Frame::new("frobnicate"));
        let answer = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(String::from_utf8_lossy(&answer).starts_with("answer error bad_command"));
    }

    #[test]
    fn modify_rejects_missing_key() {
        let (dispatcher, registry) = new_dispatcher();
        let container = registry.create_container("volatile_map", "m1").unwrap();
        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);
        let handle = session.register_container(container);

        let mut modify = Frame::new("modify");
        modify.args = vec![handle.to_string()];
        modify.fields.insert(field::KEY, Value::String(b"missing".to_vec()));
        modify.fields.insert(field::VALUE, Value::Int(1));
        modify.fields.insert(field::METADATA, Value::None);
        dispatcher.dispatch(&session, &modify);
        let answer = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(String::from_utf8_lossy(&answer).starts_with("answer error not_found"));
    }

    #[test]
    fn close_cancels_subscription() {
        let (dispatcher, registry) = new_dispatcher();
        let container = registry.create_container("volatile_list", "vl1").unwrap();
        let storage_id = container.storage_id;
        let (session, rx) = Session::new(1, ProtocolMode::Text, 1024);
        let handle = session.register_container(container);

        let mut subscribe = Frame::new("subscribe");
        subscribe.args = vec![handle.to_string(), String::new()];
        dispatcher.dispatch(&session, &subscribe);
        let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let mut close = Frame::new("close");
        close.args = vec![handle.to_string()];
        dispatcher.dispatch(&session, &close);
        let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(dispatcher.subscriptions.subscribers_for(storage_id).is_empty());
    }
}
