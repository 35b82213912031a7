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

//! HTTP is an external collaborator this crate only stubs out (§4.10): a
//! fixed `501 Not Implemented` response, enough to exercise the reactor's
//! protocol-selection branch without pulling in a real HTTP stack.

use std::io::Write;
use std::net::TcpStream;

const RESPONSE: &[u8] = b"HTTP/1.1 501 Not Implemented\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

pub fn serve_one_shot(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(RESPONSE) {
        tracing::debug!(error = %e, "http one-shot write failed");
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

pub fn looks_like_http(prefix: &[u8]) -> bool {
    prefix.starts_with(b"GET ") || prefix.starts_with(b"POST ")
}
