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

//! One persistent connection to the scanning daemon, held in IDSESSION
//! mode for the lifetime of a worker thread.

use std::{
    fmt,
    io::BufReader,
    net::{SocketAddr, TcpStream},
    path::Path,
    sync::{Mutex, TryLockError},
    time::Duration,
};

use anyhow::{bail, Context};
use clampool_protocol::{classify, Verdict, ERR_SCAN_FAILED};
use tracing::{debug, error, instrument, warn};

use crate::protocol;

/// Where the daemon lives, assembled once after name resolution and
/// immutable from then on.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ip: String,
    pub port: String,
}

impl Endpoint {
    fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .with_context(|| format!("bad daemon address {self}"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A session owns a connected stream and the mutex that keeps scan
/// traffic and keep-alive pings from interleaving on it.
///
/// While a session is registered for keep-alive the stream is open and
/// in IDSESSION mode; once its worker closes it, it is never reused.
pub struct Session {
    conn: Mutex<Conn>,
    timeout: Duration,
}

struct Conn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Conn {
    fn set_deadline(&self, deadline: Option<Duration>) -> anyhow::Result<()> {
        self.stream.set_read_timeout(deadline).context("setting read deadline")?;
        self.stream.set_write_timeout(deadline).context("setting write deadline")?;
        Ok(())
    }
}

impl Session {
    /// Open a TCP connection to the daemon. The timeout bounds both
    /// the connect itself and every later operation on the session.
    #[instrument(skip_all)]
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> anyhow::Result<Session> {
        let addr = endpoint.socket_addr()?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .context("Cannot connect to ClamAV Server.")?;
        let reader =
            BufReader::new(stream.try_clone().context("cloning daemon stream for reads")?);
        Ok(Session { conn: Mutex::new(Conn { stream, reader }), timeout })
    }

    /// Put the connection into IDSESSION mode.
    pub fn start_session(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        debug!("sending IDSESSION command");
        self.with_deadline(&mut conn, |c| {
            protocol::send_command(&mut c.stream, "IDSESSION").context("sending IDSESSION command")
        })
    }

    /// Leave IDSESSION mode. The daemon closes its end afterwards.
    pub fn end_session(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        debug!("sending END command");
        self.with_deadline(&mut conn, |c| {
            protocol::send_command(&mut c.stream, "END").context("sending END command")
        })
    }

    /// Ask the daemon for its version string.
    ///
    /// A failed send deliberately reports success with `"unknown"`:
    /// initialization only hard-fails when the daemon is reachable but
    /// its reply cannot be read.
    pub fn get_version(&self) -> anyhow::Result<String> {
        let mut conn = self.conn.lock().unwrap();
        debug!("sending VERSION command");
        let sent = self.with_deadline(&mut conn, |c| {
            protocol::send_command(&mut c.stream, "VERSION").context("sending VERSION command")
        });
        if let Err(err) = sent {
            warn!("cannot send VERSION command to the ClamAV Server: {err:#}");
            return Ok(String::from("unknown"));
        }

        let reply = self
            .with_deadline(&mut conn, |c| protocol::read_reply(&mut c.reader))
            .context("Cannot read response from ClamAV Server session.")?;
        Ok(reply.text)
    }

    /// Exchange PING/PONG with the daemon, unless the session is busy.
    ///
    /// The lock is only try-acquired: a scan in flight is all the
    /// liveness proof we need, and keep-alive must never delay it.
    pub fn ping(&self) -> anyhow::Result<()> {
        let mut conn = match self.conn.try_lock() {
            Ok(conn) => conn,
            Err(TryLockError::WouldBlock) => {
                debug!("ping pong not needed");
                return Ok(());
            }
            Err(TryLockError::Poisoned(err)) => {
                bail!("session lock poisoned: {err}");
            }
        };

        debug!("sending PING command");
        self.with_deadline(&mut conn, |c| {
            protocol::send_command(&mut c.stream, "PING").context("Cannot send PING command")
        })?;
        let reply = self
            .with_deadline(&mut conn, |c| protocol::read_reply(&mut c.reader))
            .context("Cannot read response from ClamAV Server session.")?;
        if reply.text != "PONG" {
            bail!(
                "An incorrect answer has been received from ClamAV Server '{}'.",
                reply.text
            );
        }
        Ok(())
    }

    /// Upload the file at `path` and classify the daemon's reply.
    ///
    /// Holds the session for the whole round trip, so a concurrent
    /// keep-alive pass skips this session rather than interleave bytes
    /// with the upload.
    #[instrument(skip_all, fields(file = %path.display()))]
    pub fn scan(&self, path: &Path) -> (Verdict, String) {
        let mut conn = self.conn.lock().unwrap();

        let sent = self.with_deadline(&mut conn, |c| {
            protocol::send_command(&mut c.stream, "INSTREAM").context("sending INSTREAM command")
        });
        if let Err(err) = sent {
            let msg = format!(
                "Cannot send stream to the ClamAV Server while processing scan of {}",
                path.display()
            );
            error!("{msg}: {err:#}");
            return (Verdict::Error, msg);
        }

        if let Err(err) = self.with_deadline(&mut conn, |c| protocol::send_file(&mut c.stream, path))
        {
            let msg = format!("Cannot send file to the ClamAV Server: {}", path.display());
            error!("{msg}: {err:#}");
            return (Verdict::Error, msg);
        }

        match self.with_deadline(&mut conn, |c| protocol::read_reply(&mut c.reader)) {
            Ok(reply) => {
                debug!("daemon replied: {}", reply.text);
                classify(&reply.text)
            }
            Err(err) => {
                let msg = format!("{ERR_SCAN_FAILED}Response: {err}.");
                debug!("{msg}");
                (Verdict::Error, msg)
            }
        }
    }

    /// Run one codec operation under the session's I/O deadline.
    fn with_deadline<T>(
        &self,
        conn: &mut Conn,
        f: impl FnOnce(&mut Conn) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        conn.set_deadline(Some(self.timeout))?;
        let res = f(conn);
        // the deadline has to come off on every exit path, a stale one
        // would fire mid-read on a later, slower operation
        conn.set_deadline(None)?;
        res
    }
}
