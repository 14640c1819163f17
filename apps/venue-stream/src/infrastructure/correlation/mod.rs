//! Request/Response Correlation
//!
//! Matches inbound replies to outstanding requests by correlation id.
//!
//! # Guarantees
//!
//! - An id is registered at most once while outstanding
//! - Each entry is retired exactly once: by delivery, by its waiter's
//!   deadline, by `fail_all`, or by dropping the waiter
//! - When a reply and the deadline race, whichever takes the table lock
//!   first wins; a waiter whose deadline fires after delivery still gets
//!   the reply

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub use crate::application::ports::CorrelationId;
use crate::application::ports::StreamError;
use crate::infrastructure::metrics;

type Reply = Result<Vec<u8>, StreamError>;

/// Why outstanding requests are being failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The link dropped.
    ConnectionLost(String),
    /// The connection was shut down locally.
    Shutdown,
}

impl FailReason {
    fn to_error(&self) -> StreamError {
        match self {
            Self::ConnectionLost(message) => StreamError::ConnectionLost(message.clone()),
            Self::Shutdown => StreamError::Shutdown,
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    token: u64,
    tx: oneshot::Sender<Reply>,
}

/// Table of outstanding correlated requests for one connection.
#[derive(Debug)]
pub struct MessageCorrelator {
    pending: Mutex<HashMap<CorrelationId, PendingEntry>>,
    next_token: AtomicU64,
    timeout: Duration,
}

impl MessageCorrelator {
    /// Create a correlator whose waiters give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            timeout,
        }
    }

    /// Default waiter timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register an outstanding request with the default timeout.
    ///
    /// Must be called before the request is written so a fast reply cannot
    /// arrive unmatched.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::DuplicateCorrelationId`] if the id is already
    /// outstanding.
    pub fn register(self: &Arc<Self>, id: CorrelationId) -> Result<PendingResponse, StreamError> {
        self.register_with_timeout(id, self.timeout)
    }

    /// Register an outstanding request with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::DuplicateCorrelationId`] if the id is already
    /// outstanding.
    pub fn register_with_timeout(
        self: &Arc<Self>,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<PendingResponse, StreamError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(StreamError::DuplicateCorrelationId(id));
            }
            pending.insert(id.clone(), PendingEntry { token, tx });
        }

        Ok(PendingResponse {
            id,
            token,
            rx,
            deadline: Instant::now() + timeout,
            timeout,
            correlator: Arc::clone(self),
            retired: false,
        })
    }

    /// Deliver a reply. Returns `false` if nothing was waiting for `id`.
    pub fn deliver(&self, id: &CorrelationId, raw: Vec<u8>) -> bool {
        let Some(entry) = self.pending.lock().remove(id) else {
            return false;
        };
        let _ = entry.tx.send(Ok(raw));
        true
    }

    /// Fail every outstanding request. Returns how many were failed.
    pub fn fail_all(&self, reason: &FailReason) -> usize {
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(reason.to_error()));
        }
        if count > 0 {
            tracing::debug!(count, reason = ?reason, "Failed outstanding requests");
        }
        count
    }

    /// Check if a request is outstanding.
    #[must_use]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove the entry only if it still belongs to the given waiter.
    fn retire(&self, id: &CorrelationId, token: u64) -> bool {
        let mut pending = self.pending.lock();
        if pending.get(id).is_some_and(|e| e.token == token) {
            pending.remove(id);
            true
        } else {
            false
        }
    }
}

/// Waiter for one correlated reply.
///
/// Dropping it retires the entry.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    token: u64,
    rx: oneshot::Receiver<Reply>,
    deadline: Instant,
    timeout: Duration,
    correlator: Arc<MessageCorrelator>,
    retired: bool,
}

impl PendingResponse {
    /// Correlation id being waited on.
    #[must_use]
    pub const fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the reply until the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::CorrelationTimeout`] if no reply arrived in
    /// time, or the error the table was failed with.
    pub async fn wait(mut self) -> Result<Vec<u8>, StreamError> {
        let result = tokio::time::timeout_at(self.deadline, &mut self.rx).await;
        self.retired = true;

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(StreamError::ConnectionLost(
                "correlator dropped".to_string(),
            )),
            Err(_) => {
                if self.correlator.retire(&self.id, self.token) {
                    metrics::record_correlation_timeout();
                    return Err(StreamError::CorrelationTimeout {
                        id: self.id.clone(),
                        timeout: self.timeout,
                    });
                }
                // Delivered between the deadline and the lock
                match self.rx.try_recv() {
                    Ok(reply) => reply,
                    Err(_) => Err(StreamError::CorrelationTimeout {
                        id: self.id.clone(),
                        timeout: self.timeout,
                    }),
                }
            }
        }
    }

    /// Fail the request without waiting (used when the send itself failed).
    pub fn cancel(mut self) {
        self.retired = true;
        self.correlator.retire(&self.id, self.token);
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.retired {
            self.correlator.retire(&self.id, self.token);
        }
    }
}
