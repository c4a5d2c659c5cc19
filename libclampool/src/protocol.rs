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

//! The byte-level codec for talking to the scanning daemon. Everything
//! here operates on an already-connected stream; sessions own the
//! sockets and the deadlines.

use std::{
    fs,
    io::{self, BufRead, Write},
    path::Path,
};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, WriteBytesExt as _};
use clampool_protocol::{Reply, ERR_CONNECTION_CHECK, ERR_CONNECTION_FAILED};

/// Write one command in newline-terminated command mode: a literal
/// `n`, the command text, and a trailing newline, then flush.
pub fn send_command<W: Write>(w: &mut W, command: &str) -> io::Result<()> {
    w.write_all(b"n")?;
    w.write_all(command.as_bytes())?;
    w.write_all(b"\n")?;
    w.flush()
}

/// Upload a file as one INSTREAM chunk: a 4 byte big endian length
/// prefix, the file contents, and a zero-length terminator chunk.
///
/// The length comes from a non-following stat, taken before the
/// contents are streamed. The caller must already have sent the
/// `INSTREAM` command.
pub fn send_file<W: Write>(w: &mut W, path: &Path) -> anyhow::Result<()> {
    let metadata =
        fs::symlink_metadata(path).with_context(|| format!("stating {}", path.display()))?;
    let mut file =
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;

    w.write_u32::<BigEndian>(metadata.len() as u32).context("writing chunk header")?;
    io::copy(&mut file, w).context("streaming file contents")?;
    w.write_u32::<BigEndian>(0).context("writing chunk terminator")?;
    w.flush().context("flushing upload")?;

    Ok(())
}

/// Read one newline-terminated reply line and parse it.
///
/// On transport failure the returned error displays as one of the
/// fixed connection diagnostics, so callers can hand the message
/// straight to the host.
pub fn read_reply<R: BufRead>(r: &mut R) -> anyhow::Result<Reply> {
    let mut line = String::new();
    match r.read_line(&mut line) {
        // the daemon hung up before saying anything
        Ok(0) => Err(anyhow!(ERR_CONNECTION_CHECK)),
        Ok(_) => Ok(Reply::parse(&line)),
        Err(err) => Err(anyhow::Error::new(err).context(ERR_CONNECTION_FAILED)),
    }
}
