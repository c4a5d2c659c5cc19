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

//! The engine owns the adapter's lifecycle: configuration, the
//! resolved daemon address, the session registry and the keep-alive
//! thread. Workers get sessions from `thread_init` and push files
//! through `test_file`.

use std::{
    fs, io,
    net::ToSocketAddrs as _,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use clampool_protocol::Verdict;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Config,
    consts, keepalive,
    registry::SessionRegistry,
    session::{Endpoint, Session},
};

/// Lifecycle phase of the engine. Transitions are monotone within one
/// init/close cycle; `Failed` is terminal until the next `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    Initializing,
    Running,
    Closing,
    Failed,
}

struct KeepAliveHandle {
    shutdown: crossbeam_channel::Sender<()>,
    thread: thread::JoinHandle<()>,
}

pub struct Engine {
    config: Mutex<Config>,
    state: Mutex<EngineState>,
    /// Latched at close entry; keep-alive reads it before each sleep.
    closing: Arc<AtomicBool>,
    /// In-flight `test_file` calls; close drains this to zero.
    running_scans: AtomicUsize,
    /// Resolved once during init, immutable afterwards.
    server: Mutex<Option<Endpoint>>,
    timeout: Mutex<Duration>,
    registry: Arc<SessionRegistry>,
    keepalive: Mutex<Option<KeepAliveHandle>>,
}

impl Engine {
    pub fn new(config: Config) -> Engine {
        Engine {
            config: Mutex::new(config),
            state: Mutex::new(EngineState::Closed),
            closing: Arc::new(AtomicBool::new(false)),
            running_scans: AtomicUsize::new(0),
            server: Mutex::new(None),
            timeout: Mutex::new(Duration::from_secs(consts::MIN_STARTUP_TIMEOUT_SECS)),
            registry: Arc::new(SessionRegistry::new()),
            keepalive: Mutex::new(None),
        }
    }

    /// Store one host-supplied option, see [`Config::set_option`].
    pub fn set_option(&self, name: &str, value: &str) -> bool {
        self.config.lock().unwrap().set_option(name, value)
    }

    pub fn config(&self) -> Config {
        self.config.lock().unwrap().clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap() = state;
    }

    /// Bring the engine up: load configuration, resolve the daemon,
    /// run the bootstrap handshake and start the keep-alive thread.
    ///
    /// Legal only from `Closed` or `Failed`. Any failure leaves the
    /// engine in `Failed`.
    #[instrument(skip_all)]
    pub fn init(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != EngineState::Closed && *state != EngineState::Failed {
                *state = EngineState::Failed;
                bail!("The Clam AntiVirus plugin has already been initialized.");
            }
            *state = EngineState::Initializing;
        }
        // a previous close leaves the latch set
        self.closing.store(false, Ordering::Release);

        debug!("initializing the scanning engine");
        if let Err(err) = self.bootstrap() {
            self.set_state(EngineState::Failed);
            return Err(err);
        }

        info!("the engine has been initialized");
        self.set_state(EngineState::Running);
        self.spawn_keepalive();
        Ok(())
    }

    fn bootstrap(&self) -> anyhow::Result<()> {
        let config = self.config();
        let timeout = config.startup_timeout();
        debug!("startup timeout is set to {}s", timeout.as_secs());
        *self.timeout.lock().unwrap() = timeout;

        let address = config.address.clone().unwrap_or_default();
        let endpoint = resolve(&address, &config.port())?;
        info!("ClamAV Server address: {endpoint}");
        *self.server.lock().unwrap() = Some(endpoint.clone());

        // a throwaway session proves the daemon is reachable and
        // speaks a protocol we can use before any worker shows up
        let session = Session::connect(&endpoint, timeout)?;
        if let Err(err) = session.start_session() {
            warn!("cannot initiate session to the ClamAV Server: {err:#}");
        } else {
            debug!("session initialized");
        }

        session.ping()?;

        let version = session
            .get_version()
            .context("Only ClamAV Server 0.95 and newer is supported.")?;
        debug!("daemon version: {version}");

        if let Err(err) = session.end_session() {
            warn!("cannot destroy session at the ClamAV Server: {err:#}");
        } else {
            debug!("session finished");
        }

        Ok(())
    }

    fn spawn_keepalive(&self) {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let closing = Arc::clone(&self.closing);
        let registry = Arc::clone(&self.registry);
        let spawned = thread::Builder::new()
            .name(String::from("keepalive"))
            .spawn(move || keepalive::run(shutdown_rx, closing, registry));
        match spawned {
            Ok(handle) => {
                *self.keepalive.lock().unwrap() =
                    Some(KeepAliveHandle { shutdown: shutdown_tx, thread: handle });
            }
            Err(err) => {
                warn!("unable to run the keep-alive thread: {err}");
            }
        }
    }

    /// Tear the engine down: wait for in-flight scans, stop the
    /// keep-alive thread, and go back to `Closed`. Closing a closed
    /// engine succeeds without touching anything.
    #[instrument(skip_all)]
    pub fn close(&self) -> anyhow::Result<()> {
        if self.state() == EngineState::Closed {
            debug!("the engine is already closed");
            return Ok(());
        }

        info!("the engine is closing");
        self.closing.store(true, Ordering::Release);
        self.set_state(EngineState::Closing);

        loop {
            let running = self.running_scans.load(Ordering::Acquire);
            if running == 0 {
                break;
            }
            info!("waiting for {running} running scans before closing");
            thread::sleep(consts::TICK_DURATION);
        }

        if let Some(keepalive) = self.keepalive.lock().unwrap().take() {
            drop(keepalive.shutdown);
            if keepalive.thread.join().is_err() {
                warn!("keep-alive thread panicked during shutdown");
            }
        }

        self.set_state(EngineState::Closed);
        Ok(())
    }

    /// Create one scanning session for a worker: connect, enter
    /// IDSESSION mode and join the keep-alive rotation.
    #[instrument(skip_all)]
    pub fn thread_init(&self) -> anyhow::Result<Arc<Session>> {
        debug!("initializing scan context");
        let endpoint = match self.server.lock().unwrap().clone() {
            Some(endpoint) => endpoint,
            None => {
                debug!("internal context error");
                bail!("internal context error, the engine has no resolved server");
            }
        };
        let timeout = *self.timeout.lock().unwrap();

        let session = match Session::connect(&endpoint, timeout) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                error!("cannot connect to ClamAV Server on {endpoint}: {err:#}");
                self.set_state(EngineState::Failed);
                return Err(err);
            }
        };
        if let Err(err) = session.start_session() {
            error!("cannot initiate session at the ClamAV Server: {err:#}");
            self.set_state(EngineState::Failed);
            return Err(err.context("Cannot initiate session at the ClamAV Server."));
        }

        self.registry.register(Arc::clone(&session));
        debug!("scan context initialized");
        Ok(session)
    }

    /// Tear down a worker's session. The registry entry goes away
    /// unconditionally; the result only reflects whether the daemon
    /// acknowledged the END.
    #[instrument(skip_all)]
    pub fn thread_close(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        debug!("de-initializing scan context");
        self.registry.unregister(session);
        if let Err(err) = session.end_session() {
            warn!("cannot destroy session at the ClamAV Server: {err:#}");
            return Err(err);
        }
        debug!("scan context de-initialized");
        Ok(())
    }

    /// Scan one file and report the host-visible verdict and message.
    ///
    /// The cheap file preconditions run before the session is even
    /// looked at: a missing file is a transient failure and an empty
    /// file is clean, neither involves the daemon.
    #[instrument(skip_all, fields(file = %filename.display()))]
    pub fn test_file(&self, session: Option<&Arc<Session>>, filename: &Path) -> (Verdict, String) {
        debug!("scanning file");

        let metadata = match fs::metadata(filename) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let msg = format!("{} does not exist.", filename.display());
                debug!("scanned file {msg}");
                return (Verdict::Failed, msg);
            }
            Err(err) => {
                let msg = format!("Cannot check file: {}, error: {err}", filename.display());
                debug!("{msg}");
                return (Verdict::Failed, msg);
            }
        };
        if metadata.len() == 0 {
            // zero-byte files never go to the daemon
            let msg = format!("{} is empty.", filename.display());
            debug!("scanned file {msg}");
            return (Verdict::Clean, msg);
        }

        let session = match session {
            Some(session) => session,
            None => {
                let msg = String::from("Scanning failed - No engine is initialized...");
                debug!("{msg}");
                return (Verdict::Error, msg);
            }
        };

        self.running_scans.fetch_add(1, Ordering::AcqRel);

        if self.state() != EngineState::Running {
            let msg = String::from("Scanning failed - The engine is not ready...");
            debug!("{msg}");
            self.running_scans.fetch_sub(1, Ordering::AcqRel);
            return (Verdict::Error, msg);
        }

        let (verdict, message) = session.scan(filename);
        if verdict == Verdict::Clean {
            debug!("file scanning finished successfully");
        } else {
            debug!("file scanning result: {message}");
        }
        if verdict == Verdict::VirusFound {
            info!(target: "security", "found {message} in {}", filename.display());
        }

        self.running_scans.fetch_sub(1, Ordering::AcqRel);
        (verdict, message)
    }
}

fn resolve(address: &str, port: &str) -> anyhow::Result<Endpoint> {
    // resolve with a dummy port, the daemon port rides along as
    // configured; the first record wins
    let mut records = (address, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve host ({address})."))?;
    match records.next() {
        Some(record) => Ok(Endpoint { ip: record.ip().to_string(), port: String::from(port) }),
        None => Err(anyhow!("Cannot resolve host ({address}).")),
    }
}
