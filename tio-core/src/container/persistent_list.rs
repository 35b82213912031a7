use std::sync::Arc;

use tio_protocol::{Record, Value};

use super::{volatile_list::VolatileList, ContainerBackend, ContainerKind, EventCallback};
use crate::applog::AppendLog;
use crate::error::TioResult;

/// A `volatile_list` that requires an append log to exist at creation
/// time. Storage semantics are identical to [`VolatileList`] — there is no
/// real disk-backed engine here, matching the "out of scope" framing for
/// storage backends. Mutation logging itself is owned entirely by the
/// dispatcher (§4.8: "on every dispatched mutating command"), so this
/// backend doesn't tee writes into the log itself — only registering the
/// container's global id up front.
pub struct PersistentList {
    inner: VolatileList,
}

impl PersistentList {
    pub fn new(storage_id: u64, name: String, log: Arc<AppendLog>) -> Self {
        log.ensure_container_id(&name, ContainerKind::PersistentList.as_str());
        PersistentList { inner: VolatileList::new(storage_id) }
    }
}

impl ContainerBackend for PersistentList {
    fn kind(&self) -> ContainerKind {
        ContainerKind::PersistentList
    }

    fn push_back(&self, value: Value, metadata: Value) -> TioResult<Value> {
        self.inner.push_back(value, metadata)
    }

    fn push_front(&self, value: Value, metadata: Value) -> TioResult<Value> {
        self.inner.push_front(value, metadata)
    }

    fn pop_back(&self) -> TioResult<Option<Record>> {
        self.inner.pop_back()
    }

    fn pop_front(&self) -> TioResult<Option<Record>> {
        self.inner.pop_front()
    }

    fn set(&self, key: Value, value: Value, metadata: Value) -> TioResult<()> {
        self.inner.set(key, value, metadata)
    }

    fn insert(&self, key: Value, value: Value, metadata: Value) -> TioResult<()> {
        self.inner.insert(key, value, metadata)
    }

    fn delete(&self, key: Value) -> TioResult<()> {
        self.inner.delete(key)
    }

    fn clear(&self) -> TioResult<()> {
        self.inner.clear()
    }

    fn get(&self, key: Value) -> TioResult<Option<Record>> {
        self.inner.get(key)
    }

    fn get_count(&self) -> u64 {
        self.inner.get_count()
    }

    fn get_record_by_position(&self, position: u64) -> TioResult<Option<Record>> {
        self.inner.get_record_by_position(position)
    }

    fn propset(&self, key: Value, value: Value) -> TioResult<()> {
        self.inner.propset(key, value)
    }

    fn propget(&self, key: Value) -> TioResult<Option<Value>> {
        self.inner.propget(key)
    }

    fn subscribe_events(&self, callback: EventCallback) {
        self.inner.subscribe_events(callback)
    }
}
