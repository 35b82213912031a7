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

//! Auth is an external collaborator (§6); this is a small in-memory
//! implementation of its four-method interface, not a hardened identity
//! system. `sha2` is already in the teacher's dependency orbit for this
//! kind of scope — see DESIGN.md for why it was picked over a custom
//! scheme.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::consts::META_USERS_PREFIX;

#[derive(Clone)]
struct PasswordHash {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl PasswordHash {
    fn new(password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = hash(&salt, password);
        PasswordHash { salt, digest }
    }

    fn verify(&self, password: &str) -> bool {
        hash(&self.salt, password) == self.digest
    }
}

fn hash(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

#[derive(Default, Clone, Copy)]
struct Permissions {
    create: bool,
    write: bool,
}

/// `CheckCommandAccess`/`CheckObjectAccess`/`Authenticate`/`SetPermission`,
/// plus a `__meta__/users/<name>` mirror container per user so membership
/// is discoverable the same way group membership is (§3's meta-container
/// list).
pub struct AuthTable {
    users: RwLock<HashMap<String, PasswordHash>>,
    grants: RwLock<HashMap<(String, String), Permissions>>,
    require_auth_for_write: bool,
}

const WRITE_COMMANDS: &[&str] = &[
    "create",
    "delete_container",
    "push_back",
    "push_front",
    "pop_back",
    "pop_front",
    "set",
    "insert",
    "delete",
    "clear",
    "modify",
    "wait_and_pop_next",
    "propset",
    "group_add",
    "set_permission",
];

impl AuthTable {
    /// Accepts any `name -> password` map shape (`Config::users` is a
    /// `BTreeMap` so seed order is deterministic; tests often use a plain
    /// `HashMap`).
    pub fn new<'a>(
        seed_users: impl IntoIterator<Item = (&'a String, &'a String)>,
        require_auth_for_write: bool,
    ) -> Self {
        let mut users = HashMap::new();
        for (name, password) in seed_users {
            users.insert(name.clone(), PasswordHash::new(password));
        }
        AuthTable { users: RwLock::new(users), grants: RwLock::new(HashMap::new()), require_auth_for_write }
    }

    /// `__meta__/users/<name>` entries this table implies should exist;
    /// the server bootstraps one volatile_map container per name at
    /// startup, keyed this way.
    pub fn seeded_user_container_names(&self) -> Vec<String> {
        self.users
            .read()
            .expect("auth lock poisoned")
            .keys()
            .map(|name| format!("{META_USERS_PREFIX}{name}"))
            .collect()
    }

    pub fn authenticate(&self, user: &str, password: &str) -> Option<String> {
        let users = self.users.read().expect("auth lock poisoned");
        match users.get(user) {
            Some(hash) if hash.verify(password) => Some(user.to_string()),
            _ => None,
        }
    }

    pub fn set_permission(&self, user: &str, object: &str, command: &str, allow: bool) {
        let mut grants = self.grants.write().expect("auth lock poisoned");
        let entry = grants.entry((user.to_string(), object.to_string())).or_default();
        if is_write_command(command) {
            entry.create = allow;
            entry.write = allow;
        }
    }

    /// Default-deny write commands for unauthenticated sessions (so E6 is
    /// reproducible when `require_auth_for_write` is set); default-allow
    /// everything else, including all reads.
    pub fn check_command_access(&self, user: Option<&str>, command: &str) -> bool {
        if !self.require_auth_for_write || !is_write_command(command) {
            return true;
        }
        user.is_some()
    }

    pub fn check_object_access(&self, user: Option<&str>, object: &str, command: &str) -> bool {
        if !self.check_command_access(user, command) {
            return false;
        }
        let Some(user) = user else { return true };
        match self.grants.read().expect("auth lock poisoned").get(&(user.to_string(), object.to_string())) {
            Some(perm) if is_write_command(command) => perm.write,
            _ => true,
        }
    }
}

pub fn is_write_command(command: &str) -> bool {
    WRITE_COMMANDS.contains(&command)
}
