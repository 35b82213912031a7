use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use tio_protocol::wire::EventCode;
use tio_protocol::{Record, Value};

use super::{unsupported, ContainerBackend, ContainerKind, EventCallback};
use crate::error::{TioError, TioResult};

/// In-memory keyed map. Keyed by the byte encoding of the record key so
/// both string and scalar keys sort consistently; `get_record_by_position`
/// walks this same sorted order, giving maps a stable (if backend-defined)
/// enumeration for snapshotting.
pub struct VolatileMap {
    storage_id: u64,
    records: RwLock<BTreeMap<Vec<u8>, Record>>,
    props: RwLock<std::collections::HashMap<Vec<u8>, Value>>,
    callback: Mutex<Option<EventCallback>>,
}

impl VolatileMap {
    pub fn new(storage_id: u64) -> Self {
        VolatileMap {
            storage_id,
            records: RwLock::new(BTreeMap::new()),
            props: RwLock::new(std::collections::HashMap::new()),
            callback: Mutex::new(None),
        }
    }

    fn emit(&self, code: EventCode, k: Value, v: Value, m: Value) {
        if let Some(cb) = self.callback.lock().expect("callback lock poisoned").as_ref() {
            cb(self.storage_id, code, k, v, m);
        }
    }

    fn key_bytes(key: &Value) -> TioResult<Vec<u8>> {
        match key {
            Value::String(s) => Ok(s.clone()),
            Value::Int(i) => Ok(i.to_string().into_bytes()),
            _ => Err(TioError::TypeMismatch { expected: "string or int".into(), found: "other".into() }),
        }
    }
}

impl ContainerBackend for VolatileMap {
    fn kind(&self) -> ContainerKind {
        ContainerKind::VolatileMap
    }

    fn push_back(&self, _value: Value, _metadata: Value) -> TioResult<Value> {
        Err(unsupported("push_back"))
    }

    fn push_front(&self, _value: Value, _metadata: Value) -> TioResult<Value> {
        Err(unsupported("push_front"))
    }

    fn pop_back(&self) -> TioResult<Option<Record>> {
        Err(unsupported("pop_back"))
    }

    fn pop_front(&self) -> TioResult<Option<Record>> {
        Err(unsupported("pop_front"))
    }

    /// Holds the write guard across both the mutation and the `emit` call
    /// so two concurrent mutators can never have their emits observed out
    /// of mutation order: the lock already serializes the writes, and
    /// keeping it held through `emit` serializes the callback invocations
    /// the same way (container/mod.rs's "calls are serialized relative to
    /// each other" contract means in mutation order, not just non-
    /// overlapping).
    fn set(&self, key: Value, value: Value, metadata: Value) -> TioResult<()> {
        let kb = Self::key_bytes(&key)?;
        let mut records = self.records.write().expect("map lock poisoned");
        records.insert(kb, Record::new(key.clone(), value.clone(), metadata.clone()));
        self.emit(EventCode::Set, key, value, metadata);
        drop(records);
        Ok(())
    }

    fn insert(&self, key: Value, value: Value, metadata: Value) -> TioResult<()> {
        let kb = Self::key_bytes(&key)?;
        let mut records = self.records.write().expect("map lock poisoned");
        if records.contains_key(&kb) {
            return Err(TioError::NameConflict(key.to_string()));
        }
        records.insert(kb, Record::new(key.clone(), value.clone(), metadata.clone()));
        self.emit(EventCode::Insert, key, value, metadata);
        drop(records);
        Ok(())
    }

    fn delete(&self, key: Value) -> TioResult<()> {
        let kb = Self::key_bytes(&key)?;
        let mut records = self.records.write().expect("map lock poisoned");
        let removed = records.remove(&kb);
        if let Some(r) = removed {
            self.emit(EventCode::Delete, r.key, r.value, r.metadata);
        }
        drop(records);
        Ok(())
    }

    fn clear(&self) -> TioResult<()> {
        let mut records = self.records.write().expect("map lock poisoned");
        records.clear();
        self.emit(EventCode::Clear, Value::None, Value::None, Value::None);
        drop(records);
        Ok(())
    }

    fn get(&self, key: Value) -> TioResult<Option<Record>> {
        let kb = Self::key_bytes(&key)?;
        Ok(self.records.read().expect("map lock poisoned").get(&kb).cloned())
    }

    fn get_count(&self) -> u64 {
        self.records.read().expect("map lock poisoned").len() as u64
    }

    fn get_record_by_position(&self, position: u64) -> TioResult<Option<Record>> {
        Ok(self
            .records
            .read()
            .expect("map lock poisoned")
            .values()
            .nth(position as usize)
            .cloned())
    }

    fn propset(&self, key: Value, value: Value) -> TioResult<()> {
        let kb = Self::key_bytes(&key).unwrap_or_else(|_| key.to_string().into_bytes());
        self.props.write().expect("props lock poisoned").insert(kb, value);
        Ok(())
    }

    fn propget(&self, key: Value) -> TioResult<Option<Value>> {
        let kb = Self::key_bytes(&key).unwrap_or_else(|_| key.to_string().into_bytes());
        Ok(self.props.read().expect("props lock poisoned").get(&kb).cloned())
    }

    fn subscribe_events(&self, callback: EventCallback) {
        *self.callback.lock().expect("callback lock poisoned") = Some(callback);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(s: &str) -> Value {
        Value::String(s.as_bytes().to_vec())
    }

    #[test]
    fn set_upserts() {
        let map = VolatileMap::new(1);
        map.set(key("k1"), Value::Int(1), Value::None).unwrap();
        map.set(key("k1"), Value::Int(2), Value::None).unwrap();
        assert_eq!(map.get(key("k1")).unwrap().unwrap().value, Value::Int(2));
        assert_eq!(map.get_count(), 1);
    }

    #[test]
    fn insert_rejects_existing_key() {
        let map = VolatileMap::new(1);
        map.insert(key("k1"), Value::Int(1), Value::None).unwrap();
        let err = map.insert(key("k1"), Value::Int(2), Value::None).unwrap_err();
        assert!(matches!(err, TioError::NameConflict(_)));
    }

    #[test]
    fn push_back_is_unsupported() {
        let map = VolatileMap::new(1);
        let err = map.push_back(Value::Int(1), Value::None).unwrap_err();
        assert!(matches!(err, TioError::Unsupported(_)));
    }

    #[test]
    fn get_record_by_position_follows_key_order() {
        let map = VolatileMap::new(1);
        map.set(key("b"), Value::Int(2), Value::None).unwrap();
        map.set(key("a"), Value::Int(1), Value::None).unwrap();
        let first = map.get_record_by_position(0).unwrap().unwrap();
        assert_eq!(first.key, key("a"));
    }
}
