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

//! An in-process fake of a ClamAV daemon speaking just enough
//! IDSESSION/INSTREAM to exercise the engine. Replies are scripted per
//! test, and everything the engine sends is recorded for assertions.

use std::{
    io::{BufRead as _, BufReader, Read as _, Write as _},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread, time,
};

use anyhow::Context;
use byteorder::{BigEndian, ReadBytesExt as _};

/// What to do when an INSTREAM upload finishes.
#[derive(Clone)]
pub enum ScanBehavior {
    /// Answer with `"<id>: stream: <text>"`.
    Reply(String),
    /// Hang up without answering.
    DropConnection,
}

#[derive(Clone)]
struct Script {
    ping_reply: String,
    version_reply: String,
    scan: ScanBehavior,
    scan_delay: time::Duration,
}

/// Handle on the fake daemon. The listener thread keeps running until
/// the test process exits; each test gets its own port.
pub struct FakeDaemon {
    pub port: u16,
    /// Every command line received, across all connections, without
    /// the leading `n`.
    commands: Arc<Mutex<Vec<String>>>,
    /// The raw bytes that followed each INSTREAM command: chunk
    /// framing included, exactly as they hit the wire.
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    script: Arc<Mutex<Script>>,
}

impl FakeDaemon {
    pub fn new() -> anyhow::Result<FakeDaemon> {
        let listener = TcpListener::bind("127.0.0.1:0").context("binding fake daemon")?;
        let port = listener.local_addr().context("getting local addr")?.port();

        let daemon = FakeDaemon {
            port,
            commands: Arc::new(Mutex::new(vec![])),
            frames: Arc::new(Mutex::new(vec![])),
            script: Arc::new(Mutex::new(Script {
                ping_reply: String::from("PONG"),
                version_reply: String::from("ClamAV 1.3.1/27261/Tue Jul  1 10:21:33 2025"),
                scan: ScanBehavior::Reply(String::from("OK")),
                scan_delay: time::Duration::ZERO,
            })),
        };

        let commands = Arc::clone(&daemon.commands);
        let frames = Arc::clone(&daemon.frames);
        let script = Arc::clone(&daemon.script);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    return;
                };
                let commands = Arc::clone(&commands);
                let frames = Arc::clone(&frames);
                let script = Arc::clone(&script);
                thread::spawn(move || {
                    let _ = handle_conn(stream, commands, frames, script);
                });
            }
        });

        Ok(daemon)
    }

    pub fn set_scan(&self, behavior: ScanBehavior) {
        self.script.lock().unwrap().scan = behavior;
    }

    pub fn set_scan_delay(&self, delay: time::Duration) {
        self.script.lock().unwrap().scan_delay = delay;
    }

    pub fn set_ping_reply(&self, reply: &str) {
        self.script.lock().unwrap().ping_reply = String::from(reply);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

fn handle_conn(
    stream: TcpStream,
    commands: Arc<Mutex<Vec<String>>>,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    script: Arc<Mutex<Script>>,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.try_clone().context("cloning conn")?);
    let mut writer = stream;
    let mut reply_id = 0u32;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).context("reading command")? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        let command = command.strip_prefix('n').unwrap_or(command).to_string();
        commands.lock().unwrap().push(command.clone());

        match command.as_str() {
            "IDSESSION" => {}
            "END" => return Ok(()),
            "PING" => {
                reply_id += 1;
                let reply = script.lock().unwrap().ping_reply.clone();
                writeln!(writer, "{reply_id}: {reply}").context("writing ping reply")?;
                writer.flush().context("flushing ping reply")?;
            }
            "VERSION" => {
                reply_id += 1;
                let reply = script.lock().unwrap().version_reply.clone();
                writeln!(writer, "{reply_id}: {reply}").context("writing version reply")?;
                writer.flush().context("flushing version reply")?;
            }
            "INSTREAM" => {
                // length-prefixed chunks until the zero terminator
                let mut raw = vec![];
                loop {
                    let len = reader.read_u32::<BigEndian>().context("reading chunk header")?;
                    raw.extend_from_slice(&len.to_be_bytes());
                    if len == 0 {
                        break;
                    }
                    let mut chunk = vec![0; len as usize];
                    reader.read_exact(&mut chunk).context("reading chunk body")?;
                    raw.extend_from_slice(&chunk);
                }
                frames.lock().unwrap().push(raw);

                let script = script.lock().unwrap().clone();
                if !script.scan_delay.is_zero() {
                    thread::sleep(script.scan_delay);
                }
                reply_id += 1;
                match script.scan {
                    ScanBehavior::Reply(text) => {
                        writeln!(writer, "{reply_id}: stream: {text}")
                            .context("writing scan reply")?;
                        writer.flush().context("flushing scan reply")?;
                    }
                    ScanBehavior::DropConnection => return Ok(()),
                }
            }
            _ => {}
        }
    }
}
