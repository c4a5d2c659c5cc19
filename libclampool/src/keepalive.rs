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

/*! The keep-alive scheduler pings every registered session once a
  minute so the daemon does not reap idle IDSESSION connections
  between scans. It ticks once a second, which keeps both the engine
  `closing` check and the shutdown mailbox responsive.
*/

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, span, warn, Level};

use crate::{consts, registry::SessionRegistry};

/// Run the keep-alive loop. Should be invoked in a dedicated thread.
pub fn run(
    shutdown: crossbeam_channel::Receiver<()>,
    closing: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
) {
    let _s = span!(Level::INFO, "keepalive").entered();

    let mut countdown = consts::KEEPALIVE_TIMEOUT_SECS;
    loop {
        if closing.load(Ordering::Acquire) {
            info!("bailing, the engine is closing");
            return;
        }
        match shutdown.recv_timeout(consts::TICK_DURATION) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("bailing due to shutdown signal");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        countdown = countdown.saturating_sub(1);
        if countdown > 0 {
            continue;
        }

        let sessions = registry.snapshot();
        if sessions.is_empty() {
            // the countdown stays at zero, so a session registered
            // while we sat idle gets pinged on the very next tick
            continue;
        }

        debug!("pinging {} sessions", sessions.len());
        for session in sessions {
            if let Err(err) = session.ping() {
                // the session stays registered; its next scan will
                // surface the failure as a fatal verdict
                warn!("keep-alive ping failed: {err:#}");
            }
        }
        countdown = consts::KEEPALIVE_TIMEOUT_SECS;
    }
}
