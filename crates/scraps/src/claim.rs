use reqwest::{Method, StatusCode};
use scraps_core::claims::{
    verdict_from_response, ClaimProtocolError, ClaimRequest, ClaimRequestError, ClaimVerdict,
    ReleaseRequest,
};
use scraps_core::reference::BranchRef;
use scraps_protocol::ClaimResponse;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::api::{self, ApiClient, ApiError};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Request(#[from] ClaimRequestError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("unexpected claim response: {0}")]
    Protocol(#[from] ClaimProtocolError),
    #[error("unexpected claim response: {0}")]
    Body(#[source] serde_json::Error),
}

/// Result of one claim attempt; `agent_id` is whatever identity was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimOutcome {
    pub agent_id: String,
    #[serde(flatten)]
    pub verdict: ClaimVerdict,
}

/// The server's answer to a release, kept as sent. A 2xx reply may still say
/// nothing matched (`"released": 0`), so callers report the body itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseOutcome {
    pub agent_id: String,
    pub body: Value,
}

impl ReleaseOutcome {
    fn from_text(agent_id: &str, text: &str) -> Self {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
        };
        Self {
            agent_id: agent_id.to_owned(),
            body,
        }
    }

    /// Number of claims the server says it dropped, when it says.
    pub fn released(&self) -> Option<u64> {
        self.body.get("released").and_then(Value::as_u64)
    }

    pub fn message(&self) -> Option<&str> {
        match &self.body {
            Value::String(text) => Some(text.as_str()),
            body => body
                .get("message")
                .or_else(|| body.get("error"))
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimClient {
    api: ApiClient,
}

impl ClaimClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn claim(
        &self,
        branch: &BranchRef,
        patterns: Vec<String>,
        description: &str,
        ttl_seconds: u32,
        agent_id: Option<String>,
    ) -> Result<ClaimOutcome, ClaimError> {
        let agent_id = agent_id
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(generate_agent_id);
        let req = ClaimRequest::new(agent_id, patterns, description, ttl_seconds)?;

        let url = api::claim_url(self.api.host(), branch).map_err(ApiError::from)?;
        let resp = self.api.send(Method::POST, url, &req.to_body()).await?;

        let conflict_status = resp.status == StatusCode::CONFLICT;
        if !resp.status.is_success() && !conflict_status {
            return Err(api::error_from_response(resp.status, &resp.text).into());
        }

        let parsed = parse_claim_response(&resp.text)
            .map_err(ClaimError::Body)
            .and_then(|body| verdict_from_response(body).map_err(ClaimError::from));
        let verdict = match parsed {
            Ok(v) => v,
            // A 409 that is not a conflict document is an ordinary API error.
            Err(_) if conflict_status => {
                return Err(api::error_from_response(resp.status, &resp.text).into())
            }
            Err(err) => return Err(err),
        };

        match &verdict {
            ClaimVerdict::Granted { expires_at } => {
                tracing::info!(%branch, agent_id = req.agent_id(), %expires_at, "claim granted");
            }
            ClaimVerdict::Conflict { competitors } => {
                tracing::info!(%branch, agent_id = req.agent_id(), competitors = competitors.len(), "claim conflict");
            }
        }

        Ok(ClaimOutcome {
            agent_id: req.agent_id().to_owned(),
            verdict,
        })
    }

    /// Forwards a release. The server decides whether it matched anything; its
    /// reply comes back unchanged, errors and no-ops included.
    pub async fn release(
        &self,
        branch: &BranchRef,
        patterns: Vec<String>,
        agent_id: &str,
    ) -> Result<ReleaseOutcome, ClaimError> {
        let req = ReleaseRequest::new(agent_id, patterns)?;
        let url = api::claim_url(self.api.host(), branch).map_err(ApiError::from)?;
        let resp = self.api.send(Method::DELETE, url, &req.to_body()).await?;
        if !resp.status.is_success() {
            return Err(api::error_from_response(resp.status, &resp.text).into());
        }
        let outcome = ReleaseOutcome::from_text(req.agent_id(), &resp.text);
        tracing::info!(
            %branch,
            agent_id = req.agent_id(),
            released = ?outcome.released(),
            "release answered"
        );
        Ok(outcome)
    }
}

fn parse_claim_response(text: &str) -> Result<ClaimResponse, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(ClaimResponse::default());
    }
    serde_json::from_str(text)
}

/// A fresh `cli-xxxxxxxx` identity, new for every invocation.
pub fn generate_agent_id() -> String {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        buf = nanos.to_le_bytes();
    }
    format!("cli-{}", hex::encode(buf))
}
