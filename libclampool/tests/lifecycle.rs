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

use std::{
    net::TcpListener,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use ntest::timeout;

use libclampool::{Config, Engine, EngineState, Verdict};
use support::daemon::FakeDaemon;

mod support;

#[test]
#[timeout(30000)]
fn init_runs_the_bootstrap_handshake() -> anyhow::Result<()> {
    let daemon = FakeDaemon::new()?;
    let engine = Engine::new(support::config_for(daemon.port));

    engine.init().context("initializing engine")?;

    assert_eq!(engine.state(), EngineState::Running);
    assert_eq!(daemon.commands(), vec!["IDSESSION", "PING", "VERSION", "END"]);

    engine.close()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn init_twice_fails_and_latches_failed() -> anyhow::Result<()> {
    let daemon = FakeDaemon::new()?;
    let engine = Engine::new(support::config_for(daemon.port));

    engine.init().context("first init")?;
    let err = engine.init().expect_err("second init must fail");
    assert!(err.to_string().contains("already been initialized"), "got: {err}");
    assert_eq!(engine.state(), EngineState::Failed);

    // Failed is a legal entry point for another init
    engine.init().context("init after failure")?;
    assert_eq!(engine.state(), EngineState::Running);

    engine.close()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn init_rejects_a_bad_pong() -> anyhow::Result<()> {
    let daemon = FakeDaemon::new()?;
    daemon.set_ping_reply("BONG");
    let engine = Engine::new(support::config_for(daemon.port));

    let err = engine.init().expect_err("handshake must fail");
    assert!(err.to_string().contains("incorrect answer"), "got: {err}");
    assert_eq!(engine.state(), EngineState::Failed);

    Ok(())
}

#[test]
#[timeout(30000)]
fn init_fails_on_an_unresolvable_host() {
    let engine = Engine::new(Config::default());

    let err = engine.init().expect_err("resolution must fail");
    assert!(format!("{err:#}").contains("Cannot resolve host"), "got: {err:#}");
    assert_eq!(engine.state(), EngineState::Failed);
}

#[test]
#[timeout(30000)]
fn init_fails_when_nobody_listens() -> anyhow::Result<()> {
    // grab a port and free it again so the connect gets refused
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").context("binding probe listener")?;
        listener.local_addr()?.port()
    };
    let engine = Engine::new(support::config_for(port));

    let err = engine.init().expect_err("connect must fail");
    assert!(err.to_string().contains("Cannot connect to ClamAV Server."), "got: {err}");
    assert_eq!(engine.state(), EngineState::Failed);

    Ok(())
}

#[test]
#[timeout(30000)]
fn close_is_idempotent() -> anyhow::Result<()> {
    let engine = Engine::new(Config::default());
    assert_eq!(engine.state(), EngineState::Closed);

    engine.close().context("closing a closed engine")?;
    assert_eq!(engine.state(), EngineState::Closed);
    engine.close().context("closing it again")?;
    assert_eq!(engine.state(), EngineState::Closed);

    Ok(())
}

#[test]
#[timeout(30000)]
fn full_lifecycle() -> anyhow::Result<()> {
    let daemon = FakeDaemon::new()?;
    let engine = Engine::new(support::config_for(daemon.port));

    engine.init().context("initializing engine")?;
    let session = engine.thread_init().context("opening session")?;
    engine.thread_close(&session).context("closing session")?;
    engine.close().context("closing engine")?;

    assert_eq!(engine.state(), EngineState::Closed);
    let ends = daemon.commands().iter().filter(|c| *c == "END").count();
    assert_eq!(ends, 2, "bootstrap and the worker session must both say goodbye");

    // closing again stays fine
    engine.close()?;
    Ok(())
}

#[test]
#[timeout(30000)]
fn close_waits_for_inflight_scans() -> anyhow::Result<()> {
    let daemon = FakeDaemon::new()?;
    daemon.set_scan_delay(Duration::from_secs(2));
    let engine = Arc::new(Engine::new(support::config_for(daemon.port)));
    engine.init().context("initializing engine")?;
    let session = engine.thread_init().context("opening session")?;

    let file = support::scratch_file(b"slow to scan")?;
    let path = file.path().to_path_buf();
    let scan_engine = Arc::clone(&engine);
    let scan_session = Arc::clone(&session);
    let scanner = thread::spawn(move || scan_engine.test_file(Some(&scan_session), &path));

    // give the scan time to get in flight
    thread::sleep(Duration::from_millis(300));

    let start = Instant::now();
    engine.close().context("closing engine")?;
    let waited = start.elapsed();

    let (verdict, message) = scanner.join().expect("scanner thread to finish");
    assert_eq!(verdict, Verdict::Clean);
    assert_eq!(message, "Clean");
    assert!(
        waited >= Duration::from_millis(1000),
        "close returned after {waited:?}, before the scan could have finished"
    );
    assert_eq!(engine.state(), EngineState::Closed);

    Ok(())
}

#[test]
#[timeout(30000)]
fn ping_skips_a_session_mid_scan() -> anyhow::Result<()> {
    let daemon = FakeDaemon::new()?;
    daemon.set_scan_delay(Duration::from_millis(1500));
    let engine = Arc::new(Engine::new(support::config_for(daemon.port)));
    engine.init().context("initializing engine")?;
    let session = engine.thread_init().context("opening session")?;

    let ping_count =
        |daemon: &FakeDaemon| daemon.commands().iter().filter(|c| *c == "PING").count();
    let after_init = ping_count(&daemon);

    let file = support::scratch_file(b"slow to scan")?;
    let path = file.path().to_path_buf();
    let scan_engine = Arc::clone(&engine);
    let scan_session = Arc::clone(&session);
    let scanner = thread::spawn(move || scan_engine.test_file(Some(&scan_session), &path));

    thread::sleep(Duration::from_millis(300));

    // this is exactly the call the keep-alive sweep makes
    let start = Instant::now();
    session.ping().context("contended ping must report success")?;
    assert!(start.elapsed() < Duration::from_millis(500), "skipped ping must not block");
    assert_eq!(
        ping_count(&daemon),
        after_init,
        "no PING may hit the wire while the scan holds the session"
    );

    let (verdict, _) = scanner.join().expect("scanner thread to finish");
    assert_eq!(verdict, Verdict::Clean);

    // once the session is idle again the ping really goes out
    session.ping().context("idle ping")?;
    assert_eq!(ping_count(&daemon), after_init + 1);

    engine.close()?;
    Ok(())
}
