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

//! Server configuration: parsed from TOML, then wrapped in a [`Manager`] so
//! every thread that needs a read can get one without taking a lock shared
//! with the mutation path.

use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::Deserialize;

use crate::consts::{
    DEFAULT_EVENT_BATCH, DEFAULT_MAX_FRAME_BYTES, DEFAULT_OUTBOUND_HIGH_WATERMARK, DEFAULT_PORT,
    DEFAULT_SNAPSHOT_BATCH,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port the reactor listens on.
    pub port: u16,
    /// When set, every mutating command is appended to this file.
    pub append_log_path: Option<String>,
    /// Cap on a single binary frame's declared size, in bytes.
    pub max_frame_bytes: u32,
    /// Bytes queued for one session's outbound writer before it's judged a
    /// slow consumer and disconnected.
    pub outbound_high_watermark: usize,
    /// Max records fetched per snapshot iteration batch.
    pub snapshot_batch: usize,
    /// Max events drained from the EventBus per Publisher iteration.
    pub event_batch: usize,
    /// Seed users, `name = password` in plaintext here; hashed on load.
    pub users: std::collections::BTreeMap<String, String>,
    /// If true, sessions that haven't authenticated are denied `create`,
    /// `delete_container`, `set_permission` (reproduces spec scenario E6).
    pub require_auth_for_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            append_log_path: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_high_watermark: DEFAULT_OUTBOUND_HIGH_WATERMARK,
            snapshot_batch: DEFAULT_SNAPSHOT_BATCH,
            event_batch: DEFAULT_EVENT_BATCH,
            users: Default::default(),
            require_auth_for_write: false,
        }
    }
}

pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let path = match config_file {
        Some(p) => p.clone(),
        None => return Ok(Config::default()),
    };
    if !Path::new(&path).exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("reading config file '{path}'"))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("parsing config file '{path}'"))?;
    Ok(config)
}

/// A cheaply-cloneable handle on the live config. Reloading swaps the
/// `RwLock`'s contents; readers already holding a cloned [`Config`] keep
/// seeing the old value, which is fine since config changes never need to
/// be observed mid-command.
#[derive(Debug, Clone)]
pub struct Manager {
    inner: Arc<RwLock<Config>>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        Manager { inner: Arc::new(RwLock::new(config)) }
    }

    pub fn get(&self) -> Config {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn reload(&self, config_file: &Option<String>) -> anyhow::Result<()> {
        let fresh = read_config(config_file)?;
        *self.inner.write().expect("config lock poisoned") = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_has_no_append_log() {
        let c = Config::default();
        assert!(c.append_log_path.is_none());
        assert_eq!(c.port, DEFAULT_PORT);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let c = read_config(&Some("/nonexistent/path/tio.toml".to_string())).unwrap();
        assert_eq!(c.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tio.toml");
        fs::write(&path, "port = 9999\nrequire_auth_for_write = true\n").unwrap();
        let c = read_config(&Some(path.to_string_lossy().to_string())).unwrap();
        assert_eq!(c.port, 9999);
        assert!(c.require_auth_for_write);
    }

    #[test]
    fn manager_get_reflects_initial_value() {
        let mgr = Manager::new(Config { port: 123, ..Config::default() });
        assert_eq!(mgr.get().port, 123);
    }
}
