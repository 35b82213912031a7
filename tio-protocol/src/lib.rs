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

//! tio-protocol holds the wire types that a tio client and the tio server
//! must agree on: the scalar [`Value`] union, a [`Record`] triple, the
//! binary frame's field/type ids, and event names. You almost certainly
//! don't need to depend on this directly unless you're writing a client.

mod record;
mod value;
pub mod wire;

pub use record::Record;
pub use value::Value;
