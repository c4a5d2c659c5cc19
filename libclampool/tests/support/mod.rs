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

// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::io::Write as _;

use anyhow::Context;
use libclampool::Config;

pub mod daemon;

/// Build an engine configuration pointed at a fake daemon.
pub fn config_for(port: u16) -> Config {
    Config {
        address: Some(String::from("127.0.0.1")),
        port: Some(port.to_string()),
        startup_timeout: Some(10),
    }
}

/// A scratch file with the given contents, cleaned up on drop.
pub fn scratch_file(contents: &[u8]) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new().context("creating scratch file")?;
    file.write_all(contents).context("filling scratch file")?;
    file.flush().context("flushing scratch file")?;
    Ok(file)
}
