//! Outstanding-request bookkeeping for a single physical connection.
//!
//! A [`RequestInfo`] resolves exactly once: whichever of response arrival,
//! timeout, or connection teardown reaches it first wins, and every later
//! attempt is a no-op. [`PendingRequests`] is the per-connection table that
//! owns them until then.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::TransportError;
use crate::request::{ChatRequest, ChatResponse};

/// Where the final outcome of a request is delivered.
pub(crate) type Responder = oneshot::Sender<Result<ChatResponse, TransportError>>;

enum Completion {
    Incomplete(Responder),
    Complete,
}

/// One in-flight request.
pub(crate) struct RequestInfo {
    id: u64,
    verb: String,
    path: String,
    created_at: Instant,
    completion: Mutex<Completion>,
}

impl RequestInfo {
    pub(crate) fn new(id: u64, request: &ChatRequest, responder: Responder) -> Self {
        Self {
            id,
            verb: request.verb.clone(),
            path: request.path.clone(),
            created_at: Instant::now(),
            completion: Mutex::new(Completion::Incomplete(responder)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Resolve the request. Returns `false` if it had already been resolved.
    pub(crate) fn complete(&self, result: Result<ChatResponse, TransportError>) -> bool {
        let previous = {
            let mut completion = self.completion.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *completion, Completion::Complete)
        };
        match previous {
            Completion::Incomplete(responder) => {
                debug!(
                    request_id = self.id,
                    verb = %self.verb,
                    path = %self.path,
                    elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "request resolved"
                );
                // The caller may have stopped waiting; that is not our concern.
                let _ = responder.send(result);
                true
            }
            Completion::Complete => false,
        }
    }

    pub(crate) fn fail(&self, error: TransportError) -> bool {
        self.complete(Err(error))
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        matches!(
            *self.completion.lock().unwrap_or_else(|e| e.into_inner()),
            Completion::Complete
        )
    }
}

impl Drop for RequestInfo {
    fn drop(&mut self) {
        // Never leave a caller hanging on a request nobody will answer.
        self.fail(TransportError::network("request abandoned"));
    }
}

struct PendingEntry {
    info: RequestInfo,
    timeout: Option<AbortHandle>,
}

/// Request id → [`RequestInfo`] for one connection instance.
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: HashMap<u64, PendingEntry>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A random id not currently in the table.
    pub(crate) fn fresh_id(&self) -> u64 {
        loop {
            let id = rand::random::<u64>();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn insert(&mut self, info: RequestInfo, timeout: Option<AbortHandle>) {
        self.entries.insert(info.id(), PendingEntry { info, timeout });
    }

    /// Take a request out of the table, cancelling its timeout timer.
    pub(crate) fn remove(&mut self, id: u64) -> Option<RequestInfo> {
        let entry = self.entries.remove(&id)?;
        if let Some(timeout) = entry.timeout {
            timeout.abort();
        }
        Some(entry.info)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fail every pending request. Returns how many were failed.
    pub(crate) fn fail_all(&mut self, reason: &str) -> usize {
        let ids: Vec<u64> = self.entries.keys().copied().collect();
        let mut failed = 0;
        for id in ids {
            if let Some(info) = self.remove(id)
                && info.fail(TransportError::network(reason))
            {
                failed += 1;
            }
        }
        failed
    }
}
