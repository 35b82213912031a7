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

//! Bootstrapping and bookkeeping for the meta-containers listed in §3:
//! `__meta__/users/<name>`, `__meta__/sessions`, and
//! `__meta__/session_last_command`. These are ordinary volatile_map
//! containers the registry already knows how to hold; this module just
//! knows their names and when to poke them.

use tio_protocol::Value;

use crate::auth::AuthTable;
use crate::consts::{META_SESSIONS, META_SESSION_LAST_COMMAND};
use crate::registry::ContainerRegistry;

/// Creates `__meta__/sessions`, `__meta__/session_last_command`, and one
/// `__meta__/users/<name>` container per seeded user. Called once at
/// server startup (§9: "created at server start, drained at shutdown").
pub fn initialize_meta_containers(registry: &ContainerRegistry, auth: &AuthTable) {
    let _ = registry.create_container("volatile_map", META_SESSIONS);
    let _ = registry.create_container("volatile_map", META_SESSION_LAST_COMMAND);
    for name in auth.seeded_user_container_names() {
        let _ = registry.create_container("volatile_map", &name);
    }
}

pub fn record_session_opened(registry: &ContainerRegistry, session_id: u32) {
    if let Some(c) = registry.get(META_SESSIONS) {
        let _ = c.backend.set(Value::Int(session_id as i64), Value::Int(1), Value::None);
    }
}

pub fn record_session_closed(registry: &ContainerRegistry, session_id: u32) {
    if let Some(c) = registry.get(META_SESSIONS) {
        let _ = c.backend.delete(Value::Int(session_id as i64));
    }
    if let Some(c) = registry.get(META_SESSION_LAST_COMMAND) {
        let _ = c.backend.delete(Value::Int(session_id as i64));
    }
}

pub fn record_last_command(registry: &ContainerRegistry, session_id: u32, command: &str) {
    if let Some(c) = registry.get(META_SESSION_LAST_COMMAND) {
        let _ = c.backend.set(Value::Int(session_id as i64), Value::String(command.as_bytes().to_vec()), Value::None);
    }
}
