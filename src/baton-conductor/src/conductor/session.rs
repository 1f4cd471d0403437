//! The session registry: pending bridge listeners keyed until the agent's
//! `session/new` response publishes the real session id.

use futures::channel::oneshot;
use fxhash::FxHashMap;

use baton::Error;

#[derive(Default)]
pub(crate) struct SessionRegistry {
    next_key: u64,
    pending: FxHashMap<u64, PendingSession>,
}

struct PendingSession {
    /// One waiter per bridge listener spawned for this `session/new`.
    waiters: Vec<oneshot::Sender<Result<String, Error>>>,

    /// `acp:` URL → rewritten `http://127.0.0.1:<port>` URL, kept for
    /// diagnostics.
    url_map: FxHashMap<String, String>,
}

impl SessionRegistry {
    /// Mint a key for one `session/new` request; unique for the conductor's
    /// lifetime.
    pub(crate) fn allocate_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.pending.insert(
            key,
            PendingSession {
                waiters: Vec::new(),
                url_map: FxHashMap::default(),
            },
        );
        key
    }

    pub(crate) fn add_listener(
        &mut self,
        key: u64,
        acp_url: &str,
        http_url: &str,
        waiter: oneshot::Sender<Result<String, Error>>,
    ) {
        let entry = self.pending.get_mut(&key).expect("key was allocated");
        entry.url_map.insert(acp_url.to_string(), http_url.to_string());
        entry.waiters.push(waiter);
    }

    /// Deliver the session id to every listener under the key. Fires at most
    /// once; the entry is gone afterwards.
    pub(crate) fn publish(&mut self, key: u64, session_id: &str) {
        let Some(entry) = self.pending.remove(&key) else { return };
        tracing::debug!(key, %session_id, urls = ?entry.url_map, "publishing session id to bridge listeners");
        for waiter in entry.waiters {
            let _ = waiter.send(Ok(session_id.to_string()));
        }
    }

    /// Error path: the `session/new` failed, so poison every parked waiter.
    pub(crate) fn cancel(&mut self, key: u64, error: Error) {
        let Some(entry) = self.pending.remove(&key) else { return };
        tracing::debug!(key, %error, "cancelling bridge listeners");
        for waiter in entry.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
