//! One outbound message and the handles its caller waits on.

use crate::error::{ChannelError, Result};
use crate::ids::ConnectionId;
use crate::message::{Message, MessageType, StreamSource};
use crate::signal::Signal;
use bytes::Bytes;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Encoded frame plus the stream sources that follow it on the wire
#[derive(Debug)]
pub struct Outbound {
    /// Encoded frame
    pub frame: Bytes,
    /// Side-channel sources, in declaration order
    pub streams: Vec<StreamSource>,
}

#[derive(Debug)]
struct TaskState {
    finished: bool,
    transmitted: bool,
    connected: bool,
    error: Option<ChannelError>,
    response: Option<Message>,
}

/// Send task shared between the caller, the sender loop and the receive loop.
///
/// `sent` fires when the write phase concludes. `completed` fires when the
/// matching Acknowledge or Response arrives, when the write fails, or when
/// the connection is torn down.
#[derive(Debug)]
pub struct SendTask {
    correlation_id: String,
    message_type: MessageType,
    connection_id: ConnectionId,
    outbound: Mutex<Option<Outbound>>,
    state: Mutex<TaskState>,
    sent: Signal,
    completed: Signal,
}

impl SendTask {
    /// Create a task for an encoded message bound to one connection
    pub fn new(
        message_type: MessageType,
        correlation_id: impl Into<String>,
        connection_id: ConnectionId,
        outbound: Outbound,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message_type,
            connection_id,
            outbound: Mutex::new(Some(outbound)),
            state: Mutex::new(TaskState {
                finished: false,
                transmitted: false,
                connected: true,
                error: None,
                response: None,
            }),
            sent: Signal::new(),
            completed: Signal::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Correlation id of the message
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Type of the message
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Connection the task was queued on
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Hand the frame and streams to the sender; returns `None` the second time
    pub fn take_outbound(&self) -> Option<Outbound> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Record that every byte of the message reached the socket
    pub fn mark_transmitted(&self) {
        {
            let mut state = self.state();
            state.transmitted = true;
            if !self.message_type.awaits_ack() {
                state.finished = true;
            }
        }
        self.sent.set();
        if !self.message_type.awaits_ack() {
            self.completed.set();
        }
    }

    /// Matching Acknowledge arrived
    pub fn acknowledge(&self) {
        self.state().finished = true;
        self.completed.set();
    }

    /// Matching Response arrived
    pub fn resolve(&self, response: Message) {
        {
            let mut state = self.state();
            state.response = Some(response);
            state.finished = true;
        }
        self.completed.set();
    }

    /// Capture a write failure; the first failure wins
    pub fn fail(&self, error: ChannelError) {
        {
            let mut state = self.state();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.sent.set();
        self.completed.set();
    }

    /// The connection ended before the exchange completed
    pub fn disconnect(&self) {
        self.state().connected = false;
        self.sent.set();
        self.completed.set();
    }

    /// Whether the acknowledge or response arrived
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    /// Whether the frame and its streams were fully written
    pub fn is_transmitted(&self) -> bool {
        self.state().transmitted
    }

    /// Whether the task's connection is still considered live
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Wait for the write phase to conclude
    pub async fn wait_sent(&self) {
        self.sent.wait().await
    }

    /// Wait for acknowledge, response, failure or teardown
    pub async fn wait_completed(&self) {
        self.completed.wait().await
    }

    /// Consume the outcome.
    ///
    /// A captured failure comes back as an I/O error; a task woken by
    /// teardown without a failure reports [`ChannelError::ConnectionClosed`].
    pub fn take_result(&self) -> Result<Option<Message>> {
        let mut state = self.state();
        if let Some(error) = state.error.take() {
            return Err(error.into_io());
        }
        if !state.finished && !state.connected {
            return Err(ChannelError::ConnectionClosed);
        }
        Ok(state.response.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_wire::WireError;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(message_type: MessageType) -> Arc<SendTask> {
        Arc::new(SendTask::new(
            message_type,
            "c1",
            ConnectionId::next(),
            Outbound {
                frame: Bytes::from_static(b"frame"),
                streams: Vec::new(),
            },
        ))
    }

    #[tokio::test]
    async fn test_response_wakes_waiter() {
        let task = task(MessageType::Request);
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move {
                task.wait_completed().await;
                task.take_result()
            })
        };

        task.mark_transmitted();
        assert!(!task.is_finished());
        task.resolve(Message::acknowledge("c1"));

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap().correlation_id, "c1");
    }

    #[test]
    fn test_outbound_taken_once() {
        let task = task(MessageType::Datagram);
        assert!(task.take_outbound().is_some());
        assert!(task.take_outbound().is_none());
    }

    #[test]
    fn test_disconnect_without_error_is_connection_closed() {
        let task = task(MessageType::Datagram);
        task.disconnect();
        assert!(matches!(
            task.take_result(),
            Err(ChannelError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_captured_failure_surfaces_as_io() {
        let task = task(MessageType::Datagram);
        task.fail(ChannelError::Wire(WireError::Incomplete));
        task.fail(ChannelError::ConnectionClosed);
        task.disconnect();
        assert!(matches!(task.take_result(), Err(ChannelError::Io(_))));
    }

    #[test]
    fn test_oneway_finishes_on_transmit() {
        let task = task(MessageType::DatagramOneway);
        task.mark_transmitted();
        assert!(task.is_finished());
        assert!(task.is_transmitted());
        assert!(task.take_result().unwrap().is_none());
    }

    #[test]
    fn test_ack_after_teardown_still_succeeds() {
        let task = task(MessageType::Datagram);
        task.acknowledge();
        task.disconnect();
        assert!(task.take_result().unwrap().is_none());
    }
}
