use std::sync::Arc;

use tio_protocol::{Record, Value};

use super::{volatile_map::VolatileMap, ContainerBackend, ContainerKind, EventCallback};
use crate::applog::AppendLog;
use crate::error::TioResult;

/// A `volatile_map` that requires an append log to exist at creation time.
/// Mutation logging itself is owned entirely by the dispatcher (§4.8), so
/// this backend doesn't tee writes into the log itself — only registering
/// the container's global id up front.
pub struct PersistentMap {
    inner: VolatileMap,
}

impl PersistentMap {
    pub fn new(storage_id: u64, name: String, log: Arc<AppendLog>) -> Self {
        log.ensure_container_id(&name, ContainerKind::PersistentMap.as_str());
        PersistentMap { inner: VolatileMap::new(storage_id) }
    }
}

impl ContainerBackend for PersistentMap {
    fn kind(&self) -> ContainerKind {
        ContainerKind::PersistentMap
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
