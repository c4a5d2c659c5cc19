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

use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Diagnostic used when the daemon connection drops in the middle of
/// reading a reply line.
pub const ERR_CONNECTION_FAILED: &str = "Connection to ClamAV Server has failed.";

/// Diagnostic used when the daemon connection is already gone before
/// we even attempt to read a reply.
pub const ERR_CONNECTION_CHECK: &str = "An error has occurred. Check your connection.";

/// Preamble for scan failures where the daemon never produced a usable
/// reply. The caller appends either `ERR_NO_RESPONSE` or the transport
/// diagnostic it got back.
pub const ERR_SCAN_FAILED: &str = "Scanning failed - The file cannot be scanned. ";

/// Appended to `ERR_SCAN_FAILED` when there is no reply fragment at all.
pub const ERR_NO_RESPONSE: &str = "Scanner did not respond.";

/// Signature prefixes that mean the daemon could not look inside the
/// file rather than that the file is infected. Matched with
/// prefix-equality against the signature name, not substring search.
const UNSCANNABLE_PREFIXES: [&str; 3] = ["Encrypted", "Broken", "Heuristics.Encrypted"];

/// The five-valued scan classification handed back to the host.
///
/// The discriminants are the host ABI's result codes and must not be
/// renumbered. `VirusCured` is part of the ABI but this adapter never
/// produces it (ClamAV does not disinfect).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Verdict {
    /// The file could not be scanned right now. Transient from the
    /// host's perspective.
    Failed = 0,
    /// The file is clean.
    Clean = 1,
    /// The daemon matched a signature.
    VirusFound = 2,
    /// Never emitted, present only to keep the code space aligned
    /// with the host.
    VirusCured = 3,
    /// The daemon cannot determine a verdict (encrypted or broken
    /// archive).
    Impossible = 4,
    /// Fatal. The host is expected to unload and reload the plugin.
    Error = 5,
}

impl Verdict {
    /// The raw integer the host ABI expects.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Failed => "failed",
            Verdict::Clean => "clean",
            Verdict::VirusFound => "virus-found",
            Verdict::VirusCured => "virus-cured",
            Verdict::Impossible => "impossible",
            Verdict::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// One parsed reply line from the daemon.
///
/// Inside an IDSESSION every reply arrives as `"<id>: <text>"`, and
/// stream replies additionally carry a `"stream: "` marker after the id.
/// Both prefixes are stripped during parsing. The id is informational
/// only: commands on a session are serialized under its mutex, so
/// replies never need to be correlated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: Option<u32>,
    pub text: String,
}

impl Reply {
    /// Parse a raw newline-terminated reply line.
    ///
    /// Surrounding whitespace is trimmed first. The id prefix is only
    /// recognized when everything before the first `": "` is digits;
    /// anything else is passed through untouched.
    pub fn parse(line: &str) -> Reply {
        let line = line.trim();
        if let Some((head, rest)) = line.split_once(": ") {
            if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
                let text = rest.strip_prefix("stream: ").unwrap_or(rest);
                return Reply { id: head.parse().ok(), text: String::from(text) };
            }
        }
        Reply { id: None, text: String::from(line) }
    }
}

/// Map a reply (after prefix stripping) onto the verdict the host sees.
///
/// The returned string is the host-visible message: the signature name
/// for detections, `"Clean"` for a clean file, or a description of what
/// went wrong.
pub fn classify(reply: &str) -> (Verdict, String) {
    if reply == "OK" {
        return (Verdict::Clean, String::from("Clean"));
    }

    // the daemon tags every reply with a trailing status word, for
    // example "Eicar-Test-Signature FOUND" or
    // "INSTREAM size limit exceeded. ERROR"
    if let Some(space) = reply.rfind(' ') {
        let (body, tail) = (&reply[..space], &reply[space + 1..]);
        if tail == "FOUND" {
            if UNSCANNABLE_PREFIXES.iter().any(|p| body.starts_with(p)) {
                return (Verdict::Impossible, String::from(body));
            }
            return (Verdict::VirusFound, String::from(body));
        }
        return (
            Verdict::Failed,
            format!("Scanning failed - ClamAV Server returns error: {body}"),
        );
    }

    if reply.is_empty() {
        return (Verdict::Error, format!("{ERR_SCAN_FAILED}{ERR_NO_RESPONSE}"));
    }

    (Verdict::Error, String::from("Internal error"))
}
