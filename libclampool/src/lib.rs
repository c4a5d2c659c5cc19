// Copyright 2024 Google LLC
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

//! libclampool is an adapter between a host that wants files scanned
//! and a ClamAV compatible daemon reached over TCP. Each worker thread
//! gets its own persistent IDSESSION connection; files travel to the
//! daemon as INSTREAM uploads and come back as one of five verdicts. A
//! background thread keeps idle sessions alive with PING/PONG so the
//! daemon does not reap them between scans.

pub use clampool_protocol::Verdict;
pub use config::{read_config, Config};
pub use engine::{Engine, EngineState};
pub use session::{Endpoint, Session};

pub mod config;
pub mod consts;
pub mod engine;
mod keepalive;
pub mod protocol;
pub mod registry;
pub mod session;
