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

//! A worker pool (size = CPU count, §5) that runs posted command handlers
//! so a slow handler doesn't stall a session's read loop. Jobs are plain
//! closures; crossbeam-channel is the same control-plane transport the
//! teacher uses for its reaper-registration channel.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for idx in 0..size.max(1) {
            let rx: Receiver<Job> = receiver.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("tio-worker-{idx}"))
                    .spawn(move || {
                        for job in rx {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        WorkerPool { sender, handles }
    }

    pub fn sized_to_cpu_count() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }

    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::error!("worker pool job queue is closed, dropping job");
        }
    }

    /// Closes the job queue and waits for workers to drain it. Panics
    /// from a worker thread are not caught here, matching the teacher's
    /// threads which likewise don't wrap handler bodies in `catch_unwind`.
    pub fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn posted_jobs_all_run() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = counter.clone();
            pool.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
