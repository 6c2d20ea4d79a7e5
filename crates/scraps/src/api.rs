//! HTTP plumbing shared by the claim client and the streaming transport.

use reqwest::{Method, StatusCode};
use scraps_core::reference::{BranchRef, RepoRef};
use scraps_protocol::ApiErrorBody;
use serde::Serialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API error ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("request failed")]
    Transport(#[source] reqwest::Error),
    #[error("invalid url")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Transport(_) | ApiError::Url(_) => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

/// Builds an [`ApiError::Http`] from a non-success response, preferring the
/// body's `message`, then `error`, then the raw text.
pub fn error_from_response(status: StatusCode, text: &str) -> ApiError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(text).ok();
    let message = parsed
        .as_ref()
        .and_then(ApiErrorBody::text)
        .map(str::to_owned)
        .or_else(|| {
            let t = text.trim();
            (!t.is_empty()).then(|| t.to_owned())
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_owned());
    ApiError::Http {
        status: status.as_u16(),
        message,
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    host: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(host: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let http = reqwest::Client::builder()
            .user_agent(user_agent())
            .build()
            .context("build http client")?;
        Ok(Self::with_client(http, host, api_key))
    }

    pub fn with_client(http: reqwest::Client, host: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Sends a JSON request and returns the response whatever its status.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: &B,
    ) -> Result<RawResponse, ApiError> {
        tracing::debug!(%method, %url, "api request");
        let resp = self
            .http
            .request(method, url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(ApiError::Transport)?;
        tracing::debug!(status = status.as_u16(), "api response");
        Ok(RawResponse { status, text })
    }
}

pub fn user_agent() -> String {
    format!("scraps/{}", env!("CARGO_PKG_VERSION"))
}

fn endpoint_url(host: &str, segments: &[&str]) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(host)?;
    url.path_segments_mut()
        .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Optional parameters of a live subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    pub path: Option<String>,
    pub last_event_id: Option<String>,
}

/// `GET {host}/api/v1/stores/{store}/repos/{repo}/streams/events/live`
pub fn live_events_url(host: &str, repo: &RepoRef, params: &StreamParams) -> Result<Url, url::ParseError> {
    let mut url = endpoint_url(
        host,
        &[
            "api", "v1", "stores", &repo.store, "repos", &repo.repo, "streams", "events", "live",
        ],
    )?;
    append_stream_query(&mut url, repo, params, None);
    Ok(url)
}

/// `ws(s)://{host}/stores/{store}/repos/{repo}/ws`, credential in the `token` parameter.
pub fn socket_url(
    host: &str,
    repo: &RepoRef,
    params: &StreamParams,
    token: &str,
) -> Result<Url, url::ParseError> {
    let mut url = endpoint_url(host, &["stores", &repo.store, "repos", &repo.repo, "ws"])?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
    append_stream_query(&mut url, repo, params, Some(token));
    Ok(url)
}

fn append_stream_query(url: &mut Url, repo: &RepoRef, params: &StreamParams, token: Option<&str>) {
    let mut pairs = url.query_pairs_mut();
    if let Some(token) = token {
        pairs.append_pair("token", token);
    }
    if let Some(branch) = &repo.branch {
        pairs.append_pair("branch", branch);
    }
    if let Some(path) = params.path.as_deref().filter(|p| !p.is_empty()) {
        pairs.append_pair("path", path);
    }
    if let Some(id) = params.last_event_id.as_deref().filter(|p| !p.is_empty()) {
        pairs.append_pair("lastEventId", id);
    }
    drop(pairs);
    if url.query() == Some("") {
        url.set_query(None);
    }
}

/// `{host}/stores/{store}/repos/{repo}/branches/{branch}/coordinate/claim`
pub fn claim_url(host: &str, branch: &BranchRef) -> Result<Url, url::ParseError> {
    endpoint_url(
        host,
        &[
            "stores",
            &branch.store,
            "repos",
            &branch.repo,
            "branches",
            &branch.branch,
            "coordinate",
            "claim",
        ],
    )
}
