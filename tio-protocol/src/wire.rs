//! Constants and small enums both sides of the wire must agree on: the
//! binary frame's magic bytes, field ids, data type ids, and event codes.
//! Kept separate from [`crate::value`] because these are frame-layout
//! concerns, not value-representation concerns.

use std::convert::TryFrom;

use anyhow::{anyhow, Error};

/// First four bytes of every binary-protocol connection, used by the
/// server's reactor to distinguish a binary client from a text client (or
/// an HTTP one-shot probe) before any framing has been parsed.
pub const MAGIC: [u8; 4] = *b"TIO1";

/// Field ids tag each piece of a binary frame. A frame is a sequence of
/// `[field_id:u16][data_type:u16][size:u32][bytes]` entries followed by a
/// frame terminator; not every command uses every field.
pub mod field {
    pub const COMMAND: u16 = 1;
    pub const HANDLE: u16 = 2;
    pub const CONTAINER_NAME: u16 = 3;
    pub const CONTAINER_TYPE: u16 = 4;
    pub const KEY: u16 = 5;
    pub const VALUE: u16 = 6;
    pub const METADATA: u16 = 7;
    pub const GROUP_NAME: u16 = 8;
    pub const START: u16 = 9;
    pub const QUERY_ID: u16 = 10;
    pub const ERROR_MESSAGE: u16 = 11;
    pub const EVENT_CODE: u16 = 12;
    pub const ERROR_CODE: u16 = 13;
}

/// The four data types a [`crate::Value`] can carry on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DataType {
    None = 1,
    String = 2,
    Int = 3,
    Double = 4,
}

impl TryFrom<u16> for DataType {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(DataType::None),
            2 => Ok(DataType::String),
            3 => Ok(DataType::Int),
            4 => Ok(DataType::Double),
            other => Err(anyhow!("unknown data type id {other}")),
        }
    }
}

/// Names of the change events a container can emit, used both as the text
/// protocol's event keyword and the binary frame's `EVENT_CODE` field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    PushBack,
    PushFront,
    PopBack,
    PopFront,
    Set,
    Insert,
    Delete,
    Clear,
    SnapshotEnd,
}

impl EventCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCode::PushBack => "push_back",
            EventCode::PushFront => "push_front",
            EventCode::PopBack => "pop_back",
            EventCode::PopFront => "pop_front",
            EventCode::Set => "set",
            EventCode::Insert => "insert",
            EventCode::Delete => "delete",
            EventCode::Clear => "clear",
            EventCode::SnapshotEnd => "snapshot_end",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "push_back" => EventCode::PushBack,
            "push_front" => EventCode::PushFront,
            "pop_back" => EventCode::PopBack,
            "pop_front" => EventCode::PopFront,
            "set" => EventCode::Set,
            "insert" => EventCode::Insert,
            "delete" => EventCode::Delete,
            "clear" => EventCode::Clear,
            "snapshot_end" => EventCode::SnapshotEnd,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_type_round_trip() {
        for raw in 1u16..=4 {
            let dt = DataType::try_from(raw).expect("known data type");
            assert_eq!(dt as u16, raw);
        }
        assert!(DataType::try_from(0).is_err());
        assert!(DataType::try_from(5).is_err());
    }

    #[test]
    fn event_code_round_trip() {
        let codes = [
            EventCode::PushBack,
            EventCode::PushFront,
            EventCode::PopBack,
            EventCode::PopFront,
            EventCode::Set,
            EventCode::Insert,
            EventCode::Delete,
            EventCode::Clear,
            EventCode::SnapshotEnd,
        ];
        for c in codes {
            assert_eq!(EventCode::from_str(c.as_str()), Some(c));
        }
        assert_eq!(EventCode::from_str("bogus"), None);
    }
}
