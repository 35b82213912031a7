use std::sync::{Mutex, RwLock};

use tio_protocol::wire::EventCode;
use tio_protocol::{Record, Value};

use super::{out_of_range, ContainerBackend, ContainerKind, EventCallback};
use crate::error::TioResult;

/// In-memory ordered list. Positions are dense `0..len` indices recomputed
/// on every read; nothing here attempts to keep stable handles across
/// structural shifts beyond what the spec requires (positions are
/// recomputed per call, matching "the iterator yields the state at the
/// time of each get_record_by_position call").
pub struct VolatileList {
    storage_id: u64,
    records: RwLock<Vec<Record>>,
    props: RwLock<std::collections::HashMap<Vec<u8>, Value>>,
    callback: Mutex<Option<EventCallback>>,
}

impl VolatileList {
    pub fn new(storage_id: u64) -> Self {
        VolatileList {
            storage_id,
            records: RwLock::new(Vec::new()),
            props: RwLock::new(std::collections::HashMap::new()),
            callback: Mutex::new(None),
        }
    }

    fn emit(&self, code: EventCode, k: Value, v: Value, m: Value) {
        if let Some(cb) = self.callback.lock().expect("callback lock poisoned").as_ref() {
            cb(self.storage_id, code, k, v, m);
        }
    }

    fn prop_key(key: &Value) -> Vec<u8> {
        match key {
            Value::String(s) => s.clone(),
            other => other.to_string().into_bytes(),
        }
    }
}

impl ContainerBackend for VolatileList {
    fn kind(&self) -> ContainerKind {
        ContainerKind::VolatileList
    }

    /// Holds the write guard across both the mutation and the `emit` call
    /// so two concurrent mutators (e.g. two sessions' `set`s racing on the
    /// same container) can never have their emits observed out of
    /// mutation order: the lock already serializes the writes, and
    /// keeping it held through `emit` serializes the callback invocations
    /// the same way.
    fn push_back(&self, value: Value, metadata: Value) -> TioResult<Value> {
        let mut records = self.records.write().expect("list lock poisoned");
        records.push(Record::new(Value::Int(records.len() as i64), value.clone(), metadata.clone()));
        let position = Value::Int((records.len() - 1) as i64);
        self.emit(EventCode::PushBack, position.clone(), value, metadata);
        drop(records);
        Ok(position)
    }

    fn push_front(&self, value: Value, metadata: Value) -> TioResult<Value> {
        let mut records = self.records.write().expect("list lock poisoned");
        records.insert(0, Record::new(Value::Int(0), value.clone(), metadata.clone()));
        self.emit(EventCode::PushFront, Value::Int(0), value, metadata);
        drop(records);
        Ok(Value::Int(0))
    }

    fn pop_back(&self) -> TioResult<Option<Record>> {
        let mut records = self.records.write().expect("list lock poisoned");
        let popped = records.pop();
        if let Some(ref r) = popped {
            self.emit(EventCode::PopBack, r.key.clone(), r.value.clone(), r.metadata.clone());
        }
        drop(records);
        Ok(popped)
    }

    fn pop_front(&self) -> TioResult<Option<Record>> {
        let mut records = self.records.write().expect("list lock poisoned");
        if records.is_empty() {
            return Ok(None);
        }
        let popped = records.remove(0);
        self.emit(EventCode::PopFront, popped.key.clone(), popped.value.clone(), popped.metadata.clone());
        drop(records);
        Ok(Some(popped))
    }

    fn set(&self, key: Value, value: Value, metadata: Value) -> TioResult<()> {
        let position = key.as_int().ok_or_else(out_of_range)?;
        let mut records = self.records.write().expect("list lock poisoned");
        let idx = resolve_index(position, records.len())?;
        records[idx] = Record::new(Value::Int(idx as i64), value.clone(), metadata.clone());
        self.emit(EventCode::Set, Value::Int(idx as i64), value, metadata);
        drop(records);
        Ok(())
    }

    fn insert(&self, key: Value, value: Value, metadata: Value) -> TioResult<()> {
        let position = key.as_int().ok_or_else(out_of_range)?;
        let mut records = self.records.write().expect("list lock poisoned");
        let idx = resolve_insert_index(position, records.len())?;
        records.insert(idx, Record::new(Value::Int(idx as i64), value.clone(), metadata.clone()));
        self.emit(EventCode::Insert, Value::Int(idx as i64), value, metadata);
        drop(records);
        Ok(())
    }

    fn delete(&self, key: Value) -> TioResult<()> {
        let position = key.as_int().ok_or_else(out_of_range)?;
        let mut records = self.records.write().expect("list lock poisoned");
        let idx = resolve_index(position, records.len())?;
        let removed = records.remove(idx);
        self.emit(EventCode::Delete, removed.key, removed.value, removed.metadata);
        drop(records);
        Ok(())
    }

    fn clear(&self) -> TioResult<()> {
        let mut records = self.records.write().expect("list lock poisoned");
        records.clear();
        self.emit(EventCode::Clear, Value::None, Value::None, Value::None);
        drop(records);
        Ok(())
    }

    fn get(&self, key: Value) -> TioResult<Option<Record>> {
        let position = key.as_int().ok_or_else(out_of_range)?;
        let records = self.records.read().expect("list lock poisoned");
        match resolve_index(position, records.len()) {
            Ok(idx) => Ok(records.get(idx).cloned()),
            Err(_) => Ok(None),
        }
    }

    fn get_count(&self) -> u64 {
        self.records.read().expect("list lock poisoned").len() as u64
    }

    fn get_record_by_position(&self, position: u64) -> TioResult<Option<Record>> {
        Ok(self.records.read().expect("list lock poisoned").get(position as usize).cloned())
    }

    fn propset(&self, key: Value, value: Value) -> TioResult<()> {
        self.props.write().expect("props lock poisoned").insert(Self::prop_key(&key), value);
        Ok(())
    }

    fn propget(&self, key: Value) -> TioResult<Option<Value>> {
        Ok(self.props.read().expect("props lock poisoned").get(&Self::prop_key(&key)).cloned())
    }

    fn subscribe_events(&self, callback: EventCallback) {
        *self.callback.lock().expect("callback lock poisoned") = Some(callback);
    }
}

/// Resolves a user-supplied position (possibly negative, tail-relative)
/// against `len`, for operations that address an existing element.
fn resolve_index(position: i64, len: usize) -> TioResult<usize> {
    let idx = if position < 0 { len as i64 + position } else { position };
    if idx < 0 || idx as usize >= len {
        return Err(out_of_range());
    }
    Ok(idx as usize)
}

/// Resolves a position for `insert`, which may legally target `len`
/// (append) unlike `resolve_index`. Negative magnitudes larger than `len`
/// clamp to 0, matching the spec's boundary rule for start_spec.
fn resolve_insert_index(position: i64, len: usize) -> TioResult<usize> {
    if position < 0 {
        let idx = len as i64 + position;
        return Ok(idx.max(0) as usize);
    }
    let idx = position as usize;
    if idx > len {
        return Err(out_of_range());
    }
    Ok(idx)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn push_back_assigns_increasing_positions() {
        let list = VolatileList::new(1);
        let p0 = list.push_back(Value::Int(10), Value::None).unwrap();
        let p1 = list.push_back(Value::Int(20), Value::None).unwrap();
        assert_eq!(p0, Value::Int(0));
        assert_eq!(p1, Value::Int(1));
        assert_eq!(list.get_count(), 2);
    }

    #[test]
    fn negative_index_resolves_from_tail() {
        let list = VolatileList::new(1);
        list.push_back(Value::Int(1), Value::None).unwrap();
        list.push_back(Value::Int(2), Value::None).unwrap();
        list.push_back(Value::Int(3), Value::None).unwrap();
        let r = list.get(Value::Int(-1)).unwrap().unwrap();
        assert_eq!(r.value, Value::Int(3));
    }

    #[test]
    fn out_of_range_get_is_none_not_error() {
        let list = VolatileList::new(1);
        assert_eq!(list.get(Value::Int(5)), Ok(None));
    }

    #[test]
    fn events_fire_for_each_mutation() {
        let list = VolatileList::new(1);
        let count = std::sync::Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        list.subscribe_events(std::sync::Arc::new(move |_id, _code, _k, _v, _m| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        list.push_back(Value::Int(1), Value::None).unwrap();
        list.push_front(Value::Int(2), Value::None).unwrap();
        list.pop_back().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clear_empties_and_emits_once() {
        let list = VolatileList::new(1);
        list.push_back(Value::Int(1), Value::None).unwrap();
        list.push_back(Value::Int(2), Value::None).unwrap();
        list.clear().unwrap();
        assert_eq!(list.get_count(), 0);
    }
}
