//! Request/response correlation over the single signaling socket.
//!
//! Janus replies carry the `transaction` string of the request they answer.
//! A waiter is registered before the request is written, so a fast reply can
//! never race past its waiter.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use overlook_protocol::JanusMessage;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::WebRtcError;

type Reply = Result<JanusMessage, WebRtcError>;

/// Map of in-flight transaction ids to their one-shot waiters.
#[derive(Default)]
pub struct TransactionCorrelator {
    waiters: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl TransactionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh random id: 32 lowercase hex chars, no dashes.
    pub fn next_transaction_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Register a waiter for `id`. Re-registering replaces the old waiter,
    /// which then resolves with `SignalingConnectionLost`.
    pub fn register(&self, id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), tx);
        if previous.is_some() {
            debug!(transaction = id, "Replaced duplicate transaction waiter");
        }
        PendingReply { rx }
    }

    /// Deliver a reply. Returns false when nobody is waiting for `id`.
    pub fn resolve(&self, id: &str, reply: JanusMessage) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match waiter {
            // A waiter whose future was dropped still counts as consumed.
            Some(tx) => {
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Drop a waiter without resolving it (request could not be sent).
    pub fn forget(&self, id: &str) {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Reject every outstanding waiter with `err` and empty the map.
    /// Returns how many were failed; a second call returns 0.
    pub fn fail_all(&self, err: WebRtcError) -> usize {
        let drained: Vec<_> = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        if count > 0 {
            debug!(count, %err, "Failed pending transactions");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Future resolving to the reply for one registered transaction.
pub struct PendingReply {
    rx: oneshot::Receiver<Reply>,
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(WebRtcError::SignalingConnectionLost)))
    }
}
