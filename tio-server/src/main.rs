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

//! tio is a networked in-memory data-structure server. See [the
//! README](https://github.com/tio-rs/tio) for more info. This binary is a
//! thin CLI shell around `libtio`, which does all the real work.

use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = libtio::Args::parse();
    libtio::run(args)
}
