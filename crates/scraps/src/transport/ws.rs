use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, StreamExt as _};
use scraps_core::frame::Framing;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use super::{ConnectError, Connection, Subscription, Transport};
use crate::api;

/// Socket binding: every text or binary message is one record.
#[derive(Debug, Clone)]
pub struct WsTransport {
    host: String,
    token: String,
}

impl WsTransport {
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn framing(&self) -> Framing {
        Framing::Message
    }

    async fn connect(&self, sub: &Subscription) -> Result<Connection, ConnectError> {
        let url = api::socket_url(&self.host, &sub.repo, &sub.params, &self.token)?;
        tracing::debug!(host = url.host_str().unwrap_or_default(), "opening socket");

        let (ws, _resp) = connect_async(url.as_str()).await.map_err(map_handshake_error)?;

        let records = ws.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(_) => None,
                Err(tungstenite::Error::ConnectionClosed) => None,
                Err(err) => Some(Err(err)),
            })
        });

        Ok(Connection::spawn(records))
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(resp) => {
            let status = resp.status().as_u16();
            let body = resp
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            let message = match reqwest::StatusCode::from_u16(status) {
                Ok(code) => match api::error_from_response(code, &body) {
                    api::ApiError::Http { message, .. } => message,
                    other => other.to_string(),
                },
                Err(_) => body.trim().to_owned(),
            };
            ConnectError::from_status(status, message)
        }
        other => ConnectError::Network(other.to_string()),
    }
}
