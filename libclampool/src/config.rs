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

use std::{fs, path::Path, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config<P: AsRef<Path>>(config_file: P) -> anyhow::Result<Config> {
    let config_path = config_file.as_ref();
    info!("parsing config ({})", config_path.display());
    let config_str = fs::read_to_string(config_path).context("reading config toml")?;
    let config = toml::from_str(&config_str).context("parsing config file")?;
    Ok(config)
}

/// The settings the engine recognizes. The set of names is fixed; the
/// host can only ever write these three.
#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Host name or address of the scanning daemon. There is no
    /// default; initialization fails during name resolution when it is
    /// left unset.
    pub address: Option<String>,

    /// TCP port of the scanning daemon, "3310" unless set.
    pub port: Option<String>,

    /// Seconds allowed for each daemon operation, clamped to the
    /// [10, 100] range when the engine initializes. Unset behaves
    /// like 0 and clamps up to the minimum.
    pub startup_timeout: Option<u64>,
}

impl Config {
    /// Store one host-supplied option by name. Names are matched
    /// ASCII-case-insensitively; unknown names are ignored and
    /// reported as unsaved.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        if name.eq_ignore_ascii_case("Address") {
            self.address = Some(String::from(value));
            return true;
        }
        if name.eq_ignore_ascii_case("Port") {
            self.port = Some(String::from(value));
            return true;
        }
        if name.eq_ignore_ascii_case("StartupTimeout") {
            // atoi semantics, unparsable input counts as zero and
            // gets clamped up later
            self.startup_timeout = Some(value.parse().unwrap_or(0));
            return true;
        }
        false
    }

    /// Read one option back as the string the host would see.
    pub fn option(&self, name: &str) -> Option<String> {
        if name.eq_ignore_ascii_case("Address") {
            return Some(self.address.clone().unwrap_or_default());
        }
        if name.eq_ignore_ascii_case("Port") {
            return Some(self.port());
        }
        if name.eq_ignore_ascii_case("StartupTimeout") {
            return Some(self.startup_timeout.map(|t| t.to_string()).unwrap_or_default());
        }
        None
    }

    pub fn port(&self) -> String {
        self.port.clone().unwrap_or_else(|| String::from(consts::DEFAULT_PORT))
    }

    /// The per-operation daemon timeout, clamped to the supported
    /// range.
    pub fn startup_timeout(&self) -> time::Duration {
        let raw = self.startup_timeout.unwrap_or(0);
        time::Duration::from_secs(
            raw.clamp(consts::MIN_STARTUP_TIMEOUT_SECS, consts::MAX_STARTUP_TIMEOUT_SECS),
        )
    }
}
