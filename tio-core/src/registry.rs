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

//! Name -> container lookup. The only place allowed to mint a
//! `storage_id` (§4.3); subscribes to every container's event callback at
//! creation time and forwards events into the [`crate::event_bus::EventBus`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::applog::AppendLog;
use crate::container::{
    Container, ContainerBackend, ContainerKind, PersistentList, PersistentMap, VolatileList,
    VolatileMap,
};
use crate::error::{TioError, TioResult};
use crate::event_bus::{EventBus, EventInfo};

pub struct ContainerRegistry {
    containers: RwLock<HashMap<String, Container>>,
    next_storage_id: AtomicU64,
    event_bus: Arc<EventBus>,
    applog: RwLock<Option<Arc<AppendLog>>>,
}

impl ContainerRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        ContainerRegistry {
            containers: RwLock::new(HashMap::new()),
            next_storage_id: AtomicU64::new(1),
            event_bus,
            applog: RwLock::new(None),
        }
    }

    pub fn set_append_log(&self, log: Arc<AppendLog>) {
        *self.applog.write().expect("registry lock poisoned") = Some(log);
    }

    fn mint_storage_id(&self) -> u64 {
        self.next_storage_id.fetch_add(1, Ordering::SeqCst)
    }

    fn build_backend(&self, kind: ContainerKind, storage_id: u64, name: &str) -> TioResult<Arc<dyn ContainerBackend>> {
        Ok(match kind {
            ContainerKind::VolatileList => Arc::new(VolatileList::new(storage_id)),
            ContainerKind::VolatileMap => Arc::new(VolatileMap::new(storage_id)),
            ContainerKind::PersistentList => {
                let log = self.require_applog()?;
                Arc::new(PersistentList::new(storage_id, name.to_string(), log))
            }
            ContainerKind::PersistentMap => {
                let log = self.require_applog()?;
                Arc::new(PersistentMap::new(storage_id, name.to_string(), log))
            }
        })
    }

    fn require_applog(&self) -> TioResult<Arc<AppendLog>> {
        self.applog
            .read()
            .expect("registry lock poisoned")
            .clone()
            .ok_or_else(|| TioError::InternalError("persistent containers require an append log path".into()))
    }

    /// `CreateContainer(type, name) -> Container`. Fails with
    /// `NameConflict` if `name` already exists (create-only semantics) and
    /// `TypeUnknown` if `type` isn't a known backend kind. The conflict
    /// check and the insert happen under the same write-lock hold so two
    /// concurrent `create`s of the same name can't both pass the check.
    pub fn create_container(&self, type_name: &str, name: &str) -> TioResult<Container> {
        let kind = ContainerKind::from_str(type_name)
            .ok_or_else(|| TioError::TypeUnknown(type_name.to_string()))?;
        let mut containers = self.containers.write().expect("registry lock poisoned");
        if containers.contains_key(name) {
            return Err(TioError::NameConflict(name.to_string()));
        }
        let storage_id = self.mint_storage_id();
        let backend = self.build_backend(kind, storage_id, name)?;
        let container = Container { storage_id, name: name.to_string(), backend };
        self.install_locked(&mut containers, container.clone());
        Ok(container)
    }

    /// `OpenContainer(type_or_empty, name) -> Container`. An empty
    /// `type_name` matches any existing container; a non-empty one must
    /// agree with the stored kind or this errors `TypeMismatch`.
    pub fn open_container(&self, type_name: &str, name: &str) -> TioResult<Container> {
        let containers = self.containers.read().expect("registry lock poisoned");
        let container = containers.get(name).cloned().ok_or_else(|| TioError::NotFound(name.to_string()))?;
        if !type_name.is_empty() {
            let requested = ContainerKind::from_str(type_name)
                .ok_or_else(|| TioError::TypeUnknown(type_name.to_string()))?;
            if requested != container.kind() {
                return Err(TioError::TypeMismatch {
                    expected: requested.to_string(),
                    found: container.kind().to_string(),
                });
            }
        }
        Ok(container)
    }

    /// Removes `name` from the registry. Sessions with an already-resolved
    /// handle keep their `Arc<Container>` working until they close it
    /// (invariant 2).
    pub fn delete_container(&self, name: &str) -> TioResult<()> {
        let removed = self.containers.write().expect("registry lock poisoned").remove(name);
        if removed.is_none() {
            return Err(TioError::NotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Container> {
        self.containers.read().expect("registry lock poisoned").get(name).cloned()
    }

    pub fn enumerate_by_prefix(&self, prefix: &str) -> Vec<Container> {
        self.containers
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|c| c.name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Registers `container`'s event callback (forwarding into the
    /// EventBus) and makes it visible to future `open_container` calls.
    /// Used by the server's meta-container bootstrap, which installs
    /// containers it constructs directly rather than through
    /// `create_container`.
    pub fn install(&self, container: Container) {
        let mut containers = self.containers.write().expect("registry lock poisoned");
        self.install_locked(&mut containers, container);
    }

    fn install_locked(&self, containers: &mut HashMap<String, Container>, container: Container) {
        let bus = self.event_bus.clone();
        container.backend.subscribe_events(Arc::new(move |storage_id, event_code, k, v, m| {
            bus.push(EventInfo { storage_id, event_code, k, v, m });
        }));
        containers.insert(container.name.clone(), container);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_registry() -> ContainerRegistry {
        ContainerRegistry::new(Arc::new(EventBus::new()))
    }

    #[test]
    fn create_then_open_round_trips() {
        let reg = new_registry();
        let c = reg.create_container("volatile_list", "l1").unwrap();
        assert_eq!(c.storage_id, 1);
        let opened = reg.open_container("volatile_list", "l1").unwrap();
        assert_eq!(opened.storage_id, c.storage_id);
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let reg = new_registry();
        reg.create_container("volatile_list", "l1").unwrap();
        let err = reg.create_container("volatile_list", "l1").unwrap_err();
        assert!(matches!(err, TioError::NameConflict(_)));
    }

    /// Concurrent creates of the same name must see exactly one winner;
    /// the conflict check and the insert share one write-lock hold so a
    /// second thread can't slip between "name free" and "name taken".
    #[test]
    fn concurrent_create_has_exactly_one_winner() {
        let reg = Arc::new(new_registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.create_container("volatile_list", "race").is_ok())
            })
            .collect();
        let wins = handles.into_iter().filter(|h| h.join().unwrap()).count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn create_rejects_unknown_type() {
        let reg = new_registry();
        let err = reg.create_container("bogus_type", "l1").unwrap_err();
        assert!(matches!(err, TioError::TypeUnknown(_)));
    }

    #[test]
    fn open_missing_container_not_found() {
        let reg = new_registry();
        let err = reg.open_container("", "missing").unwrap_err();
        assert!(matches!(err, TioError::NotFound(_)));
    }

    #[test]
    fn open_with_wrong_type_mismatches() {
        let reg = new_registry();
        reg.create_container("volatile_list", "l1").unwrap();
        let err = reg.open_container("volatile_map", "l1").unwrap_err();
        assert!(matches!(err, TioError::TypeMismatch { .. }));
    }

    #[test]
    fn storage_ids_are_monotonic_and_unique() {
        let reg = new_registry();
        let a = reg.create_container("volatile_list", "a").unwrap();
        let b = reg.create_container("volatile_map", "b").unwrap();
        assert_ne!(a.storage_id, b.storage_id);
    }

    #[test]
    fn mutation_forwards_into_event_bus() {
        let bus = Arc::new(EventBus::new());
        let reg = ContainerRegistry::new(bus.clone());
        let c = reg.create_container("volatile_list", "l1").unwrap();
        c.backend.push_back(tio_protocol::Value::Int(1), tio_protocol::Value::None).unwrap();
        let batch = bus.drain_batch(10, std::time::Duration::from_millis(100));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].storage_id, c.storage_id);
    }

    #[test]
    fn enumerate_by_prefix_filters() {
        let reg = new_registry();
        reg.create_container("volatile_list", "__meta__/sessions").unwrap();
        reg.create_container("volatile_list", "user_list").unwrap();
        let found = reg.enumerate_by_prefix("__meta__/");
        assert_eq!(found.len(), 1);
    }
}
