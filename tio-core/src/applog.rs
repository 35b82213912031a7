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

//! Optional binary replay log. Not required for correctness of the running
//! system (§4.8) — every write is best-effort, errors are logged via
//! `tracing::warn!` and otherwise swallowed rather than surfaced to the
//! client whose command triggered them.
//!
//! Container global ids are assigned the first time a container is seen
//! (on `create`/`open`) and reused for every subsequent line, mirroring
//! the bookkeeping in the original tiodb `BinaryProtocolLogger`: a
//! `name -> id` map plus a single monotonic counter, not reset across
//! container churn within one run.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use tio_protocol::Value;

struct Inner {
    writer: BufWriter<File>,
    global_ids: HashMap<String, u64>,
    last_global_id: u64,
}

pub struct AppendLog {
    inner: Mutex<Inner>,
}

impl AppendLog {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AppendLog {
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                global_ids: HashMap::new(),
                last_global_id: 0,
            }),
        })
    }

    /// Assigns (or returns) `name`'s global id, writing a one-time header
    /// line the first time it's seen. The original logs this as a
    /// `create` line even when the triggering command was `open` — kept
    /// verbatim since replay tooling built against that log format
    /// expects it.
    pub fn ensure_container_id(&self, name: &str, type_name: &str) -> u64 {
        let mut inner = self.inner.lock().expect("applog lock poisoned");
        if let Some(id) = inner.global_ids.get(name) {
            return *id;
        }
        inner.last_global_id += 1;
        let id = inner.last_global_id;
        inner.global_ids.insert(name.to_string(), id);
        let line = format!(
            "{},create,{},{},{}\n",
            timestamp(),
            id,
            encode_scalar(&Value::String(name.as_bytes().to_vec())),
            encode_scalar(&Value::String(type_name.as_bytes().to_vec())),
        );
        if let Err(e) = inner.writer.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, container = name, "append log header write failed");
        }
        id
    }

    pub fn log_group_add(&self, group: &str, container: &str) {
        let mut inner = self.inner.lock().expect("applog lock poisoned");
        let id = *inner.global_ids.get(container).unwrap_or(&0);
        let line = format!(
            "{},group_add,{},{},{}\n",
            timestamp(),
            id,
            encode_scalar(&Value::String(group.as_bytes().to_vec())),
            encode_scalar(&Value::String(container.as_bytes().to_vec())),
        );
        if let Err(e) = inner.writer.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, group, container, "append log group_add write failed");
        }
    }

    pub fn log_mutation(&self, container: &str, op: &str, k: &Value, v: &Value, m: &Value) {
        let mut inner = self.inner.lock().expect("applog lock poisoned");
        let id = *inner.global_ids.get(container).unwrap_or(&0);
        let line = format!(
            "{},{},{},{},{},{}\n",
            timestamp(),
            op,
            id,
            encode_scalar(k),
            encode_scalar(v),
            encode_scalar(m),
        );
        if let Err(e) = inner.writer.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, container, op, "append log write failed");
        }
    }

    /// Called once per drained EventBus batch; buffered writes are not
    /// durable until this runs.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("applog lock poisoned");
        if let Err(e) = inner.writer.flush() {
            tracing::warn!(error = %e, "append log flush failed");
        }
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `<type-letter><len>,<bytes>` for string/int/double, bare `n` for none.
fn encode_scalar(v: &Value) -> String {
    match v {
        Value::None => "n".to_string(),
        Value::String(s) => format!("s{},{}", s.len(), String::from_utf8_lossy(s)),
        Value::Int(i) => {
            let s = i.to_string();
            format!("i{},{}", s.len(), s)
        }
        Value::Double(d) => {
            let s = d.to_string();
            format!("d{},{}", s.len(), s)
        }
    }
}
