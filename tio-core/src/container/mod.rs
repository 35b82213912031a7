//! `ContainerBackend` is the "external collaborator" the core treats as
//! opaque: a uniform list/map data structure that knows how to store
//! records and emit per-mutation events. Only two concrete backends exist
//! in this crate (`volatile_list`, `volatile_map`); the persistent variants
//! are thin wrappers that additionally register a global id in the append
//! log at creation time (see [`crate::applog`]) — mutation logging itself
//! is the dispatcher's job, uniformly across all container kinds.

mod persistent_list;
mod persistent_map;
mod volatile_list;
mod volatile_map;

use std::fmt;
use std::sync::Arc;

use tio_protocol::wire::EventCode;
use tio_protocol::{Record, Value};

use crate::error::{TioError, TioResult};

pub use persistent_list::PersistentList;
pub use persistent_map::PersistentMap;
pub use volatile_list::VolatileList;
pub use volatile_map::VolatileMap;

/// Callback signature a backend invokes on every mutation:
/// `(storage_id, event_code, key, value, metadata)`. May run on any
/// thread, but the backend guarantees calls for one container are
/// serialized relative to each other.
pub type EventCallback = Arc<dyn Fn(u64, EventCode, Value, Value, Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    VolatileList,
    VolatileMap,
    PersistentList,
    PersistentMap,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::VolatileList => "volatile_list",
            ContainerKind::VolatileMap => "volatile_map",
            ContainerKind::PersistentList => "persistent_list",
            ContainerKind::PersistentMap => "persistent_map",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "volatile_list" => ContainerKind::VolatileList,
            "volatile_map" => ContainerKind::VolatileMap,
            "persistent_list" => ContainerKind::PersistentList,
            "persistent_map" => ContainerKind::PersistentMap,
            _ => return None,
        })
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ContainerKind::VolatileList | ContainerKind::PersistentList)
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The uniform operations every backend supports, regardless of whether it
/// backs a list or a map. List-only/map-only semantics (e.g. `push_back`
/// rejecting on a map) are enforced by each implementation returning
/// `TioError::Unsupported`, not by splitting the trait — the dispatcher
/// deals with one capability interface (design note: "dynamic dispatch
/// over container types").
pub trait ContainerBackend: Send + Sync {
    fn kind(&self) -> ContainerKind;

    fn push_back(&self, value: Value, metadata: Value) -> TioResult<Value>;
    fn push_front(&self, value: Value, metadata: Value) -> TioResult<Value>;
    fn pop_back(&self) -> TioResult<Option<Record>>;
    fn pop_front(&self) -> TioResult<Option<Record>>;

    /// Upsert: set the value (and metadata) at `key`, creating the slot
    /// for map containers or overwriting an existing position for lists.
    fn set(&self, key: Value, value: Value, metadata: Value) -> TioResult<()>;
    /// Insert at `key`: for lists, shifts subsequent elements; for maps,
    /// behaves like `set` (there is no shifting concept for maps).
    fn insert(&self, key: Value, value: Value, metadata: Value) -> TioResult<()>;
    fn delete(&self, key: Value) -> TioResult<()>;
    fn clear(&self) -> TioResult<()>;

    fn get(&self, key: Value) -> TioResult<Option<Record>>;
    fn get_count(&self) -> u64;
    /// Stable positional enumeration used by both list iteration and the
    /// snapshot protocol; maps enumerate in a fixed (key-sorted) order.
    fn get_record_by_position(&self, position: u64) -> TioResult<Option<Record>>;

    fn propset(&self, key: Value, value: Value) -> TioResult<()>;
    fn propget(&self, key: Value) -> TioResult<Option<Value>>;

    /// Registers the one and only event callback for this container's
    /// lifetime; only the registry calls this, once, at creation time.
    fn subscribe_events(&self, callback: EventCallback);
}

fn unsupported(op: &str) -> TioError {
    TioError::Unsupported(op.to_string())
}

fn out_of_range() -> TioError {
    TioError::OutOfRange
}

/// A named, identified handle on a backend. This is what the registry
/// hands out and what sessions store in their handle tables; `storage_id`
/// is the only thing the registry is allowed to mint (§4.3).
#[derive(Clone)]
pub struct Container {
    pub storage_id: u64,
    pub name: String,
    pub backend: Arc<dyn ContainerBackend>,
}

impl Container {
    pub fn kind(&self) -> ContainerKind {
        self.backend.kind()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("storage_id", &self.storage_id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}
