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

//! Named sets of containers with retroactive subscribe (§4.6). Grounded
//! directly on tiodb's `GroupManager`/`GroupInfo`: membership is
//! append-only within a run (`RemoveContainer` is a documented no-op, see
//! DESIGN.md) and `AddContainer` on an already-member container is a
//! silent no-op rather than an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tio_protocol::Value;

use crate::applog::AppendLog;
use crate::consts::meta_group_container;
use crate::container::Container;
use crate::error::TioResult;
use crate::registry::ContainerRegistry;
use crate::session::Session;

struct GroupSubscriberInfo {
    session: Weak<Session>,
    start_spec: String,
}

struct GroupInfo {
    #[allow(dead_code)]
    group_name: String,
    list_mirror: Container,
    members: HashMap<String, Container>,
    subscribers: HashMap<u32, GroupSubscriberInfo>,
}

impl GroupInfo {
    fn new(group_name: &str, list_mirror: Container) -> Self {
        GroupInfo { group_name: group_name.to_string(), list_mirror, members: HashMap::new(), subscribers: HashMap::new() }
    }
}

/// Callback the group manager uses to drive a session's normal
/// subscription machinery; supplied by the dispatcher/server layer so
/// this module doesn't need a direct dependency on the subscription
/// table or publisher.
pub type SubscribeFn = dyn Fn(&Arc<Session>, &Container, &str) + Send + Sync;

pub struct GroupManager {
    groups: Mutex<HashMap<String, GroupInfo>>,
    registry: Arc<ContainerRegistry>,
    applog: RwLock<Option<Arc<AppendLog>>>,
}

impl GroupManager {
    pub fn new(registry: Arc<ContainerRegistry>) -> Self {
        GroupManager { groups: Mutex::new(HashMap::new()), registry, applog: RwLock::new(None) }
    }

    pub fn set_append_log(&self, log: Arc<AppendLog>) {
        *self.applog.write().expect("group manager lock poisoned") = Some(log);
    }

    fn ensure_group(&self, groups: &mut HashMap<String, GroupInfo>, group_name: &str) -> TioResult<()> {
        if groups.contains_key(group_name) {
            return Ok(());
        }
        let mirror_name = meta_group_container(group_name);
        let mirror = match self.registry.get(&mirror_name) {
            Some(c) => c,
            None => self.registry.create_container("volatile_map", &mirror_name)?,
        };
        groups.insert(group_name.to_string(), GroupInfo::new(group_name, mirror));
        Ok(())
    }

    /// `AddContainer(group, container)`: records membership (idempotent —
    /// re-adding the same container name is a no-op, matching the
    /// original's `if already present, return`), updates the list mirror,
    /// and retroactively subscribes every current group subscriber.
    pub fn add_container(&self, group_name: &str, container: Container, subscribe: &SubscribeFn) -> TioResult<()> {
        let mut groups = self.groups.lock().expect("group manager lock poisoned");
        self.ensure_group(&mut groups, group_name)?;
        let group = groups.get_mut(group_name).expect("just ensured");

        if group.members.contains_key(&container.name) {
            return Ok(());
        }
        group.members.insert(container.name.clone(), container.clone());
        group
            .list_mirror
            .backend
            .set(Value::String(container.name.as_bytes().to_vec()), Value::String(group_name.as_bytes().to_vec()), Value::None)?;

        if let Some(log) = self.applog.read().expect("group manager lock poisoned").as_ref() {
            log.log_group_add(group_name, &container.name);
        }

        for sub in group.subscribers.values() {
            if let Some(session) = sub.session.upgrade() {
                if session.is_alive() {
                    subscribe(&session, &container, &sub.start_spec);
                }
            }
        }
        Ok(())
    }

    /// `SubscribeGroup(session, group, start_spec)`: ensures the group's
    /// list mirror exists, registers it in the session's handle table so
    /// membership announcements flow through the normal event path,
    /// subscribes to every current member, then records the subscriber so
    /// future `add_container` calls retroactively include it.
    pub fn subscribe_group(&self, session: &Arc<Session>, group_name: &str, start_spec: &str, subscribe: &SubscribeFn) -> TioResult<Container> {
        let mut groups = self.groups.lock().expect("group manager lock poisoned");
        self.ensure_group(&mut groups, group_name)?;
        let group = groups.get_mut(group_name).expect("just ensured");

        let mirror = group.list_mirror.clone();
        session.register_container(mirror.clone());

        for member in group.members.values() {
            subscribe(session, member, start_spec);
        }

        group.subscribers.insert(session.id, GroupSubscriberInfo { session: Arc::downgrade(session), start_spec: start_spec.to_string() });
        Ok(mirror)
    }

    /// A no-op in this revision: the original source never implements
    /// container removal from a group either (open question in §9,
    /// answered as "intentional freeze" in DESIGN.md).
    pub fn remove_container(&self, _group_name: &str, _container_name: &str) -> bool {
        false
    }
}
