use async_trait::async_trait;
use reqwest::header;
use scraps_core::frame::Framing;

use super::{ConnectError, Connection, Subscription, Transport};
use crate::api;

/// Streaming-HTTP binding: a long-lived `GET` whose body is an event stream.
#[derive(Debug, Clone)]
pub struct SseTransport {
    http: reqwest::Client,
    host: String,
    api_key: String,
}

impl SseTransport {
    pub fn new(http: reqwest::Client, host: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn framing(&self) -> Framing {
        Framing::EventStream
    }

    async fn connect(&self, sub: &Subscription) -> Result<Connection, ConnectError> {
        let url = api::live_events_url(&self.host, &sub.repo, &sub.params)?;
        tracing::debug!(%url, "opening event stream");

        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| ConnectError::Network(error_chain(&err)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = match api::error_from_response(status, &text) {
                api::ApiError::Http { message, .. } => message,
                other => other.to_string(),
            };
            return Err(ConnectError::from_status(status.as_u16(), message));
        }

        Ok(Connection::spawn(resp.bytes_stream()))
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}
