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

use std::time;

/// Seconds between keep-alive ping sweeps over the registered sessions.
pub const KEEPALIVE_TIMEOUT_SECS: u64 = 60;

/// Granularity of the keep-alive countdown and of the drain poll
/// performed while the engine closes.
pub const TICK_DURATION: time::Duration = time::Duration::from_secs(1);

/// Lower clamp for the configured startup timeout, in seconds.
pub const MIN_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Upper clamp for the configured startup timeout, in seconds.
pub const MAX_STARTUP_TIMEOUT_SECS: u64 = 100;

/// Port the scanning daemon listens on unless configured otherwise.
pub const DEFAULT_PORT: &str = "3310";
