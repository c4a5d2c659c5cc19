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

//! Bridges the crate's tracing output onto the host's printf-style log
//! callback. The host expects one line per call, prefixed with its
//! severity taxonomy: `ERR: ` for errors, `WRN: ` for warnings,
//! `SEC: ` for security events, and an unprefixed debug channel tagged
//! `External_plugin: ` for everything else.

use std::{
    ffi::CString,
    io,
    sync::Mutex,
};

use lazy_static::lazy_static;
use libc::c_char;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

/// The host's variadic log callback. Messages are always passed
/// pre-formatted through a `"%s"` format so `%` in scan results stays
/// inert.
pub type LogCallback = unsafe extern "C" fn(*const c_char, ...);

lazy_static! {
    static ref CALLBACK: Mutex<Option<LogCallback>> = Mutex::new(None);
}

/// Store (or clear) the host callback. Safe to call more than once;
/// the latest callback wins.
pub fn set_callback(callback: Option<LogCallback>) {
    *CALLBACK.lock().unwrap() = callback;
}

/// Install a tracing subscriber that forwards every event to the host
/// callback. Best effort: if some other subscriber already owns the
/// process (e.g. the CLI's), this quietly does nothing.
pub fn install() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_ansi(false)
        .with_writer(HostMakeWriter)
        .try_init();
}

fn forward(prefix: &'static str, line: &str) {
    let callback = *CALLBACK.lock().unwrap();
    let Some(callback) = callback else {
        return;
    };
    let Ok(text) = CString::new(format!("{prefix}{line}")) else {
        return;
    };
    unsafe { callback(b"%s\0".as_ptr().cast(), text.as_ptr()) };
}

/// Buffers one formatted event and hands it to the host callback,
/// line by line, when the subscriber is done with it.
pub struct HostWriter {
    prefix: &'static str,
    buf: Vec<u8>,
}

impl io::Write for HostWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for HostWriter {
    fn drop(&mut self) {
        for line in self.buf.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            forward(self.prefix, &String::from_utf8_lossy(line));
        }
    }
}

pub struct HostMakeWriter;

impl<'a> MakeWriter<'a> for HostMakeWriter {
    type Writer = HostWriter;

    fn make_writer(&'a self) -> Self::Writer {
        HostWriter { prefix: "External_plugin: ", buf: vec![] }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let prefix = if meta.target() == "security" {
            "SEC: "
        } else if *meta.level() == Level::ERROR {
            "ERR: "
        } else if *meta.level() == Level::WARN {
            "WRN: "
        } else {
            "External_plugin: "
        };
        HostWriter { prefix, buf: vec![] }
    }
}
