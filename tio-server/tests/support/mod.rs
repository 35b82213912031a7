// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use libtio::config::Config;
use libtio::server::Server;

/// Boots a real `Server` on an OS-assigned loopback port in a background
/// thread and returns the port, the way `server.rs`'s own unit tests do but
/// without needing a fixed port number per test.
pub fn spawn_server(config: Config) -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("binding an ephemeral port");
    let port = listener.local_addr().expect("local_addr").port();
    let server = Server::bootstrap(config).expect("bootstrap");
    std::thread::spawn(move || {
        let _ = Server::serve(server, listener);
    });
    port
}

pub fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream.set_read_timeout(Some(Duration::from_secs(2))).expect("set_read_timeout");
            return stream;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("could not connect to test server on port {port}");
}

pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn new(port: u16) -> Self {
        let stream = connect(port);
        let reader = BufReader::new(stream.try_clone().expect("cloning stream for reader"));
        Client { stream, reader }
    }

    pub fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).expect("writing a line to the test server");
    }

    pub fn send_payload(&mut self, command_line: &str, payload: &str) {
        self.stream.write_all(format!("{command_line} {}\r\n{payload}\r\n", payload.len()).as_bytes())
            .expect("writing a payload-bearing line to the test server");
    }

    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("reading a line from the test server");
        line
    }
}
