//! Thin consumer wrapper around a subscribed `AsyncEnumerableRequest`
//! stream, so callers don't have to match on [`StreamEvent`] directly and
//! so cancellation happens automatically if the caller stops polling.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::{ClientConnection, StreamEvent};

/// A single item or terminal outcome from a server-streamed call.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Item(Vec<u8>),
    Done,
    Failed(String),
}

/// Consumer handle for one active stream. Sends `AsyncEnumerableCancel` on
/// drop if the stream was not already drained to completion.
pub struct AsyncStream {
    stream_id: Uuid,
    connection: Arc<ClientConnection>,
    receiver: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl AsyncStream {
    pub fn new(stream_id: Uuid, connection: Arc<ClientConnection>, receiver: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            stream_id,
            connection,
            receiver,
            finished: false,
        }
    }

    /// Awaits the next item; returns `None` once the stream has completed
    /// or failed.
    pub async fn next(&mut self) -> Option<StreamOutcome> {
        if self.finished {
            return None;
        }
        match self.receiver.recv().await {
            Some(StreamEvent::Item(data)) => Some(StreamOutcome::Item(data)),
            Some(StreamEvent::Complete) => {
                self.finished = true;
                Some(StreamOutcome::Done)
            }
            Some(StreamEvent::Error(e)) => {
                self.finished = true;
                Some(StreamOutcome::Failed(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let stream_id = self.stream_id;
        let connection = self.connection.clone();
        tokio::spawn(async move {
            let _ = connection.cancel_stream(stream_id).await;
        });
    }
}
