use crate::Value;

/// The `(key, value, metadata)` triple carried by every container mutation
/// and every subscription event. `metadata` is almost always `Value::None`
/// in practice, but containers never assume that.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub key: Value,
    pub value: Value,
    pub metadata: Value,
}

impl Record {
    pub fn new(key: Value, value: Value, metadata: Value) -> Self {
        Record { key, value, metadata }
    }

    pub fn key_value(key: Value, value: Value) -> Self {
        Record { key, value, metadata: Value::None }
    }
}
