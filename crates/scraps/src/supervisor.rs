//! Keeps a subscription alive across disconnects.

use std::sync::Arc;
use std::time::Duration;

use scraps_core::backoff::Backoff;
use scraps_core::event::{classify, Event};
use scraps_core::frame::FrameDecoder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{ConnectError, Connection, Subscription, Transport, TransportEvent};

#[derive(Debug)]
pub enum SupervisorEvent {
    Connecting { attempt: u32 },
    Connected,
    Event(Event),
    DecodeWarning(String),
    Disconnected {
        attempt: u32,
        retry_in: Duration,
        reason: String,
    },
    Fatal(ConnectError),
    Stopped,
}

pub struct Supervisor {
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    backoff: Backoff,
    cancel: CancellationToken,
    jitter: fn() -> f64,
}

enum PumpEnd {
    Cancelled,
    Lost(String),
}

impl Supervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        subscription: Subscription,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            subscription,
            backoff,
            cancel,
            jitter: fastrand::f64,
        }
    }

    /// Replaces the jitter source; it must return values in `[0, 1)`.
    pub fn with_jitter(mut self, jitter: fn() -> f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn spawn(self, capacity: usize) -> (mpsc::Receiver<SupervisorEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let join = tokio::spawn(self.run(tx));
        (rx, join)
    }

    /// Runs until cancelled, until the receiver goes away, or until the server
    /// rejects the credential. Ends with `Stopped` unless the receiver is gone.
    pub async fn run(self, tx: mpsc::Sender<SupervisorEvent>) {
        let mut decoder = FrameDecoder::new(self.transport.framing());
        let mut attempt: u32 = 0;
        let mut initial = true;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if tx.send(SupervisorEvent::Connecting { attempt }).await.is_err() {
                return;
            }

            // Replay from a cursor only makes sense for the very first request.
            let sub = if initial {
                self.subscription.clone()
            } else {
                self.subscription.without_replay()
            };
            initial = false;

            info!(repo = %sub.repo, attempt, "connecting to live feed");
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.transport.connect(&sub) => res,
            };

            let reason = match connected {
                Ok(mut conn) => {
                    attempt = 0;
                    info!(repo = %sub.repo, "live feed connected");
                    if tx.send(SupervisorEvent::Connected).await.is_err() {
                        return;
                    }
                    decoder.reset();
                    let end = self.pump(&mut conn, &mut decoder, &tx).await;
                    conn.close();
                    match end {
                        Some(PumpEnd::Lost(reason)) => reason,
                        Some(PumpEnd::Cancelled) => break,
                        None => return,
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "live feed rejected the subscription");
                    let _ = tx.send(SupervisorEvent::Fatal(err)).await;
                    return;
                }
                Err(err) => err.to_string(),
            };

            let retry_in = self.backoff.jittered(attempt, (self.jitter)());
            warn!(
                reason = %reason,
                attempt,
                delay_ms = retry_in.as_millis() as u64,
                "live feed lost; reconnecting"
            );
            if tx
                .send(SupervisorEvent::Disconnected {
                    attempt,
                    retry_in,
                    reason,
                })
                .await
                .is_err()
            {
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(retry_in) => {}
            }
            attempt = attempt.saturating_add(1);
        }

        debug!("supervisor stopped");
        let _ = tx.send(SupervisorEvent::Stopped).await;
    }

    /// Returns `None` when the receiver is gone.
    async fn pump(
        &self,
        conn: &mut Connection,
        decoder: &mut FrameDecoder,
        tx: &mpsc::Sender<SupervisorEvent>,
    ) -> Option<PumpEnd> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(PumpEnd::Cancelled),
                next = conn.recv() => next,
            };

            let bytes = match next {
                Some(TransportEvent::Data(bytes)) => bytes,
                Some(TransportEvent::Closed { error }) => {
                    return Some(PumpEnd::Lost(
                        error.unwrap_or_else(|| "stream closed".to_owned()),
                    ));
                }
                None => return Some(PumpEnd::Lost("stream closed".to_owned())),
            };

            for record in decoder.push(&bytes) {
                let msg = match record {
                    Ok(value) => SupervisorEvent::Event(classify(&value)),
                    Err(err) => {
                        warn!(error = %err, "skipping undecodable record");
                        SupervisorEvent::DecodeWarning(err.to_string())
                    }
                };
                if tx.send(msg).await.is_err() {
                    return None;
                }
            }
        }
    }
}
