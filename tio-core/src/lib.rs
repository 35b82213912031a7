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

//! libtio: the accept loop, container registry, subscription fan-out,
//! group manager and command dispatcher that make up the tio server.
//! `tio-server` is a thin CLI shell around this crate — see [`run`].

use std::fs;
use std::io;
use std::net::TcpListener;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod applog;
pub mod auth;
pub mod codec;
pub mod config;
pub mod consts;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod group;
mod http_stub;
pub mod meta;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod session;
pub mod subscription;
pub mod worker;

pub use error::TioError;
pub use server::Server;

/// The command line arguments the tio daemon expects. Exposed as a struct
/// rather than parsed inline so a wrapping binary (or a test harness) can
/// construct them directly instead of going through `std::env::args`.
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
pub struct Args {
    #[clap(short, long, help = "Print version and exit")]
    pub version: bool,

    #[clap(
        short,
        long,
        action,
        help = "TCP port to listen on (overrides the config file's `port`)"
    )]
    pub port: Option<u16>,

    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to. Defaults to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(short, long, action, help = "A toml file containing server configuration")]
    pub config: Option<String>,

    #[clap(
        short = 'V',
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    pub verbose: u8,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parses [`Config`](config::Config), wires up the tracing subscriber,
/// bootstraps a [`Server`], binds the listener and runs the accept loop
/// until it errors or the process is killed. Returns non-zero (via `Err`)
/// on a bind/listen failure, per §6's documented exit codes.
pub fn run(args: Args) -> anyhow::Result<()> {
    if args.version {
        println!("tio {VERSION}");
        return Ok(());
    }

    init_tracing(&args);

    let mut config = config::read_config(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .with_context(|| format!("binding TCP listener on port {}", config.port))?;
    tracing::info!(port = config.port, "tio listening");

    let server = server::Server::bootstrap(config)?;
    server::Server::serve(server, listener)
}

fn init_tracing(args: &Args) {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    match &args.log_file {
        Some(path) => {
            if let Ok(file) = fs::File::create(path) {
                builder.with_writer(Mutex::new(file)).init();
                return;
            }
            builder.with_writer(io::stderr).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
}
