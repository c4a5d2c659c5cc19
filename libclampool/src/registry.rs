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

use std::sync::{Arc, Mutex};

use crate::session::Session;

/// The sessions the keep-alive pass must touch. A session is in here
/// exactly as long as a worker holds it open.
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry { sessions: Mutex::new(vec![]) }
    }

    /// Add a session to the ping rotation.
    pub fn register(&self, session: Arc<Session>) {
        self.sessions.lock().unwrap().push(session);
    }

    /// Drop the first entry holding the same session. Matching is by
    /// handle identity, not by contents, and a missing entry is a
    /// no-op.
    pub fn unregister(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(idx) = sessions.iter().position(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(idx);
        }
    }

    /// A copy of the current membership, so callers can iterate
    /// without holding the registry lock across slow pings.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().clone()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use std::{net::TcpListener, time::Duration};

    use super::*;
    use crate::session::Endpoint;

    fn connected_session(listener: &TcpListener) -> Arc<Session> {
        let port = listener.local_addr().expect("local addr").port();
        let endpoint = Endpoint { ip: String::from("127.0.0.1"), port: port.to_string() };
        Arc::new(Session::connect(&endpoint, Duration::from_secs(1)).expect("session to connect"))
    }

    #[test]
    fn register_unregister() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener to bind");
        let registry = SessionRegistry::new();

        let first = connected_session(&listener);
        let second = connected_session(&listener);
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));
        assert_eq!(registry.snapshot().len(), 2);

        registry.unregister(&first);
        let remaining = registry.snapshot();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &second));

        // unregistering something that is not there is fine
        registry.unregister(&first);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
