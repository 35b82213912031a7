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

//! The reactor: one `TcpListener::incoming` accept loop handing each
//! connection off to its own reader/writer thread pair, grounded on the
//! teacher's `daemon::server::Server::serve`/`handle_conn` split. Command
//! bodies never run on the reader thread — every parsed frame is posted to
//! the [`WorkerPool`] so a blocking handler (`wait_and_pop_next`) can't
//! stall the accept loop or another session's reads.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tio_protocol::wire::MAGIC;
use tracing::{info, instrument, warn};

use crate::applog::AppendLog;
use crate::auth::AuthTable;
use crate::codec::{self, binary, text, Frame};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::event_bus::EventBus;
use crate::group::GroupManager;
use crate::http_stub;
use crate::meta;
use crate::publisher::Publisher;
use crate::registry::ContainerRegistry;
use crate::session::{ProtocolMode, Session};
use crate::subscription::SubscriptionTable;
use crate::worker::WorkerPool;

/// How long the protocol sniff waits for the first bytes of a new
/// connection before giving up and assuming the text protocol.
const SNIFF_TIMEOUT: Duration = Duration::from_millis(1000);
const SNIFF_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct Server {
    registry: Arc<ContainerRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    worker: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    publisher_shutdown: Arc<AtomicBool>,
    max_frame_bytes: u32,
    outbound_high_watermark: usize,
    conn_counter: AtomicUsize,
}

impl Server {
    /// Wires up the registry, subscription table, group manager, auth
    /// table, append log (if configured), worker pool, and dispatcher, then
    /// seeds the `__meta__/*` containers and starts the Publisher thread
    /// (§3, §4.4, §4.8).
    #[instrument(skip_all)]
    pub fn bootstrap(config: Config) -> anyhow::Result<Arc<Self>> {
        let event_bus = Arc::new(EventBus::new());
        let registry = Arc::new(ContainerRegistry::new(event_bus.clone()));
        let subscriptions = Arc::new(SubscriptionTable::new());
        let groups = Arc::new(GroupManager::new(registry.clone()));
        let auth = Arc::new(AuthTable::new(config.users.iter(), config.require_auth_for_write));
        let worker = Arc::new(WorkerPool::sized_to_cpu_count());

        let applog = match &config.append_log_path {
            Some(path) => {
                let log = Arc::new(AppendLog::open(path).with_context(|| format!("opening append log '{path}'"))?);
                registry.set_append_log(log.clone());
                groups.set_append_log(log.clone());
                Some(log)
            }
            None => None,
        };

        meta::initialize_meta_containers(&registry, &auth);

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            subscriptions.clone(),
            groups.clone(),
            auth.clone(),
            worker.clone(),
            applog.clone(),
            config.snapshot_batch,
        ));

        let publisher = Publisher::new(event_bus, subscriptions.clone(), applog, config.event_batch);
        let publisher_shutdown = publisher.shutdown_handle();
        publisher.spawn();

        Ok(Arc::new(Server {
            registry,
            subscriptions,
            worker,
            dispatcher,
            publisher_shutdown,
            max_frame_bytes: config.max_frame_bytes,
            outbound_high_watermark: config.outbound_high_watermark,
            conn_counter: AtomicUsize::new(0),
        }))
    }

    /// Accepts connections until the listener errors or is closed,
    /// spawning one thread per connection (the teacher's `serve` loop,
    /// generalized from a Unix listener to a TCP one).
    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let conn_id = server.conn_counter.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                    let server = Arc::clone(&server);
                    std::thread::Builder::new()
                        .name(format!("tio-conn-{conn_id}"))
                        .spawn(move || {
                            if let Err(err) = server.handle_conn(stream, conn_id) {
                                warn!(conn_id, error = ?err, "connection handler exited with error");
                            }
                        })
                        .expect("failed to spawn connection thread");
                }
                Err(err) => {
                    warn!(error = ?err, "accepting connection");
                }
            }
        }
        Ok(())
    }

    /// Stops the Publisher thread. The worker pool and any still-running
    /// connection threads are left to wind down on their own since there is
    /// no single handle that owns every connection (each session's writer
    /// thread exits once its `Session` is dropped).
    pub fn shutdown(&self) {
        self.publisher_shutdown.store(true, Ordering::SeqCst);
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, stream: TcpStream, conn_id: u32) -> anyhow::Result<()> {
        stream.set_nodelay(true).context("setting TCP_NODELAY")?;

        let mode = sniff_protocol(&stream);
        if mode == ProtocolMode::HttpOneShot {
            http_stub::serve_one_shot(stream);
            return Ok(());
        }

        let (session, outbound_rx) = Session::new(conn_id, mode, self.outbound_high_watermark);
        meta::record_session_opened(&self.registry, session.id);
        info!(conn_id, ?mode, "session opened");

        let writer_stream = stream.try_clone().context("cloning stream for writer thread")?;
        let writer_session = session.clone();
        std::thread::Builder::new()
            .name(format!("tio-writer-{conn_id}"))
            .spawn(move || run_writer(writer_stream, writer_session, outbound_rx))
            .expect("failed to spawn writer thread");

        let read_stream = stream.try_clone().context("cloning stream for reader")?;
        match mode {
            ProtocolMode::Text => self.run_text_reader(read_stream, &session),
            ProtocolMode::Binary => self.run_binary_reader(read_stream, &session),
            ProtocolMode::HttpOneShot => unreachable!("handled above"),
        }

        session.mark_dead();
        for (handle, _name, storage_id) in session.list_handles() {
            self.subscriptions.unsubscribe(storage_id, handle);
        }
        meta::record_session_closed(&self.registry, session.id);
        let _ = stream.shutdown(Shutdown::Both);
        info!(conn_id, "session closed");
        Ok(())
    }

    fn run_text_reader(&self, stream: TcpStream, session: &Arc<Session>) {
        let mut reader = BufReader::new(stream);
        loop {
            if !session.is_alive() {
                break;
            }
            match text::read_frame(&mut reader, self.max_frame_bytes) {
                Ok(None) => break,
                Ok(Some(frame)) => self.post_dispatch(session, frame),
                Err(e) => {
                    let bytes = codec::encode_answer_frame(ProtocolMode::Text, &Err::<Option<tio_protocol::Value>, _>(e));
                    if !session.enqueue_outbound(bytes) {
                        break;
                    }
                }
            }
        }
    }

    fn run_binary_reader(&self, stream: TcpStream, session: &Arc<Session>) {
        let mut reader = BufReader::new(stream);
        let mut magic_buf = [0u8; 4];
        if reader.read_exact(&mut magic_buf).is_err() || magic_buf != MAGIC {
            return;
        }
        loop {
            if !session.is_alive() {
                break;
            }
            match reader.fill_buf() {
                Ok(buf) if buf.is_empty() => break,
                Ok(_) => {}
                Err(_) => break,
            }
            match binary::read_frame(&mut reader, self.max_frame_bytes) {
                Ok(frame) => self.post_dispatch(session, frame),
                Err(e) => {
                    // The byte stream can't be resynchronized after a
                    // malformed binary frame, so report the error and stop.
                    let bytes = codec::encode_answer_frame(ProtocolMode::Binary, &Err::<Option<tio_protocol::Value>, _>(e));
                    let _ = session.enqueue_outbound(bytes);
                    break;
                }
            }
        }
    }

    /// Queues `frame` on the session's own dispatch queue and, if nothing
    /// is already draining it, posts one job to the shared worker pool to
    /// do so. That job dispatches `frame` and then keeps pulling the next
    /// queued frame for this same session (instead of returning and
    /// letting the pool interleave it with some other session's next
    /// frame), so per-session command completion stays totally ordered
    /// even though many sessions share one pool of worker threads.
    fn post_dispatch(&self, session: &Arc<Session>, frame: Frame) {
        if let Some(first) = session.enqueue_command(frame) {
            let session = session.clone();
            let dispatcher = self.dispatcher.clone();
            self.worker.post(move || {
                let mut frame = first;
                loop {
                    dispatcher.dispatch(&session, &frame);
                    match session.next_command_or_idle() {
                        Some(next) => frame = next,
                        None => break,
                    }
                }
            });
        }
    }
}

/// Drains `rx` onto `stream`, one encoded frame at a time, until the
/// session's `Sender` is dropped (every `Arc<Session>` gone, including any
/// still-running worker job) or a write fails.
fn run_writer(mut stream: TcpStream, session: Arc<Session>, rx: crossbeam_channel::Receiver<Vec<u8>>) {
    for frame in rx {
        if let Err(e) = stream.write_all(&frame) {
            warn!(session_id = session.id, error = ?e, "writer thread failed, marking session dead");
            session.mark_dead();
            break;
        }
    }
}

/// Peeks the first bytes of a freshly accepted connection to decide which
/// protocol it's speaking (§4.1, §4.10), without consuming them — binary
/// and text readers each do their own framing from byte zero.
fn sniff_protocol(stream: &TcpStream) -> ProtocolMode {
    let mut buf = [0u8; 8];
    let deadline = std::time::Instant::now() + SNIFF_TIMEOUT;
    loop {
        match stream.peek(&mut buf) {
            Ok(n) if n >= 4 => {
                if buf[..4] == MAGIC {
                    return ProtocolMode::Binary;
                }
                if http_stub::looks_like_http(&buf[..n]) {
                    return ProtocolMode::HttpOneShot;
                }
                return ProtocolMode::Text;
            }
            Ok(_) if std::time::Instant::now() < deadline => {
                std::thread::sleep(SNIFF_POLL_INTERVAL);
            }
            _ => return ProtocolMode::Text,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bootstrap_on(port: u16) -> Arc<Server> {
        let config = Config { port, ..Config::default() };
        Server::bootstrap(config).expect("bootstrap")
    }

    fn spawn_listener(server: Arc<Server>, port: u16) {
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind");
        std::thread::spawn(move || {
            let _ = Server::serve(server, listener);
        });
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn text_ping_round_trips() {
        let port = 21605;
        let server = bootstrap_on(port);
        spawn_listener(server, port);

        let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        conn.write_all(b"ping\r\n").unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"answer ok\r\n");
    }

    #[test]
    fn create_then_get_count_over_text() {
        let port = 21606;
        let server = bootstrap_on(port);
        spawn_listener(server, port);

        let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        conn.write_all(b"create mylist volatile_list\r\n").unwrap();
        let mut buf = [0u8; 128];
        let n = conn.read(&mut buf).expect("read create reply");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("answer ok"));

        conn.write_all(b"get_count 1\r\n").unwrap();
        let n = conn.read(&mut buf).expect("read get_count reply");
        assert_eq!(&buf[..n], b"answer ok 0\r\n");
    }

    #[test]
    fn http_probe_gets_501_and_closes() {
        let port = 21607;
        let server = bootstrap_on(port);
        spawn_listener(server, port);

        let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        conn.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).expect("read");
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 501"));
    }

    #[test]
    fn unknown_command_reports_bad_command_and_connection_stays_open() {
        let port = 21608;
        let server = bootstrap_on(port);
        spawn_listener(server, port);

        let mut conn = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        conn.write_all(b"frobnicate\r\n").unwrap();
        let mut buf = [0u8; 128];
        let n = conn.read(&mut buf).expect("read");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("answer error bad_command"));

        conn.write_all(b"ping\r\n").unwrap();
        let n = conn.read(&mut buf).expect("read second reply");
        assert_eq!(&buf[..n], b"answer ok\r\n");
    }
}
