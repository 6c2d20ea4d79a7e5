//! One physical connection to the live event feed.
//!
//! A transport only moves bytes. Framing and classification happen in the
//! supervisor, so both bindings share the same decoding path.

pub mod sse;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use scraps_core::frame::Framing;
use scraps_core::reference::RepoRef;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::StreamParams;

pub use sse::SseTransport;
pub use ws::WsTransport;

const CHANNEL_CAPACITY: usize = 64;

/// What to subscribe to. Reconnects reuse it minus the replay cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub repo: RepoRef,
    pub params: StreamParams,
}

impl Subscription {
    pub fn new(repo: RepoRef, path: Option<String>, last_event_id: Option<String>) -> Self {
        Self {
            repo,
            params: StreamParams {
                path,
                last_event_id,
            },
        }
    }

    pub fn without_replay(&self) -> Self {
        let mut next = self.clone();
        next.params.last_event_id = None;
        next
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unauthorized (401): {message}")]
    Unauthorized { message: String },
    #[error("forbidden (403): {message}")]
    Forbidden { message: String },
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("connect failed: {0}")]
    Network(String),
    #[error("invalid stream url")]
    Url(#[from] url::ParseError),
}

impl ConnectError {
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => ConnectError::Unauthorized { message },
            403 => ConnectError::Forbidden { message },
            _ => ConnectError::Status { status, message },
        }
    }

    /// Retrying cannot fix these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectError::Unauthorized { .. } | ConnectError::Forbidden { .. } | ConnectError::Url(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(Bytes),
    /// Always the last delivery of a connection.
    Closed { error: Option<String> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn framing(&self) -> Framing;

    async fn connect(&self, sub: &Subscription) -> Result<Connection, ConnectError>;
}

/// A live connection. Dropping it closes the underlying socket.
#[derive(Debug)]
pub struct Connection {
    rx: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl Connection {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Idempotent; a handle from [`Connection::close_handle`] can call it from other tasks.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn close_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Forwards `stream` until it ends, fails, or the connection is closed.
    /// Exactly one `Closed` is delivered in every case.
    pub fn spawn<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            let error = loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break None,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(bytes)) => {
                        let sent = tokio::select! {
                            _ = token.cancelled() => break None,
                            sent = tx.send(TransportEvent::Data(bytes)) => sent,
                        };
                        if sent.is_err() {
                            break None;
                        }
                    }
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                }
            };
            let _ = tx.send(TransportEvent::Closed { error }).await;
        });

        Self { rx, cancel, join }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.join.abort();
    }
}
