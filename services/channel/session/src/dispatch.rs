//! Per-session ordered delivery of received messages.

use crate::ids::SessionId;
use crate::message::Message;
use crate::session_map::SessionObserver;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// Delivers a session's messages to the observer in receipt order.
///
/// A single worker drains an unbounded queue and exits after sitting idle
/// for `idle_timeout`; the next message starts a new worker. Messages marked
/// parallel skip the queue and are delivered on their own task.
///
/// Enqueueing never waits. The receive loop that feeds the queue is also the
/// only reader of the Acknowledges a handler's reply waits for.
pub(crate) struct OrderedDispatcher {
    session_id: SessionId,
    observer: Weak<dyn SessionObserver>,
    slot: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    backlog: AtomicUsize,
    backlog_warning: usize,
    idle_timeout: Duration,
}

impl OrderedDispatcher {
    pub(crate) fn new(
        session_id: SessionId,
        observer: Weak<dyn SessionObserver>,
        backlog_warning: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            observer,
            slot: Mutex::new(None),
            backlog: AtomicUsize::new(0),
            backlog_warning,
            idle_timeout,
        })
    }

    pub(crate) async fn dispatch(self: &Arc<Self>, message: Message) {
        if message.parallel {
            let this = self.clone();
            tokio::spawn(async move { this.deliver(message).await });
            return;
        }

        // The slot stays locked across the send so an idle worker cannot
        // retire between our clone of the sender and the enqueue.
        let mut slot = self.slot.lock().await;
        let tx = match slot.as_ref() {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                trace!("Starting dispatch worker for session {}", self.session_id);
                tokio::spawn(self.clone().run_worker(rx));
                *slot = Some(tx.clone());
                tx
            }
        };

        match tx.send(message) {
            Ok(()) => {
                let queued = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
                if queued == self.backlog_warning {
                    warn!(
                        "Session {} has {} messages waiting for the handler",
                        self.session_id, queued
                    );
                }
            }
            Err(e) => debug!(
                "Dispatch worker for session {} gone, dropping message {}",
                self.session_id, e.0.correlation_id
            ),
        }
    }

    async fn deliver_queued(&self, message: Message) {
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        self.deliver(message).await;
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(message)) => self.deliver_queued(message).await,
                Ok(None) => break,
                Err(_) => {
                    let mut slot = self.slot.lock().await;
                    match rx.try_recv() {
                        Ok(message) => {
                            drop(slot);
                            self.deliver_queued(message).await;
                        }
                        Err(_) => {
                            *slot = None;
                            break;
                        }
                    }
                }
            }
        }
        trace!("Dispatch worker for session {} idle, exiting", self.session_id);
    }

    async fn deliver(&self, message: Message) {
        match self.observer.upgrade() {
            Some(observer) => {
                observer
                    .message_received(self.session_id.clone(), message)
                    .await
            }
            None => debug!(
                "No observer for session {}, dropping message {}",
                self.session_id, message.correlation_id
            ),
        }
    }

    #[cfg(test)]
    async fn has_worker(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    #[cfg(test)]
    fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}
