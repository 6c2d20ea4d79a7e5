//! Claim and release value types.
//!
//! The server is the only arbiter of overlap between patterns; nothing here
//! tries to predict a conflict.

use scraps_protocol::{
    ClaimConflict, ClaimRequestBody, ClaimResponse, ReleaseRequestBody, CLAIM_CONFLICT,
};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_TTL_SECONDS: u32 = 300;
pub const DEFAULT_DESCRIPTION: &str = "CLI claim";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimRequestError {
    #[error("at least one pattern is required")]
    NoPatterns,
    #[error("patterns must not be blank")]
    BlankPattern,
    #[error("agent id must not be empty")]
    EmptyAgentId,
    #[error("ttl must be greater than zero")]
    ZeroTtl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    agent_id: String,
    patterns: Vec<String>,
    description: String,
    ttl_seconds: u32,
}

impl ClaimRequest {
    pub fn new(
        agent_id: impl Into<String>,
        patterns: Vec<String>,
        description: impl Into<String>,
        ttl_seconds: u32,
    ) -> Result<Self, ClaimRequestError> {
        let agent_id = validate_agent_id(agent_id.into())?;
        let patterns = validate_patterns(patterns)?;
        if ttl_seconds == 0 {
            return Err(ClaimRequestError::ZeroTtl);
        }
        let description = description.into();
        let description = if description.trim().is_empty() {
            DEFAULT_DESCRIPTION.to_owned()
        } else {
            description
        };

        Ok(Self {
            agent_id,
            patterns,
            description,
            ttl_seconds,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    pub fn to_body(&self) -> ClaimRequestBody {
        ClaimRequestBody {
            agent_id: self.agent_id.clone(),
            patterns: self.patterns.clone(),
            claim: self.description.clone(),
            ttl_seconds: self.ttl_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    agent_id: String,
    patterns: Vec<String>,
}

impl ReleaseRequest {
    pub fn new(agent_id: impl Into<String>, patterns: Vec<String>) -> Result<Self, ClaimRequestError> {
        Ok(Self {
            agent_id: validate_agent_id(agent_id.into())?,
            patterns: validate_patterns(patterns)?,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn to_body(&self) -> ReleaseRequestBody {
        ReleaseRequestBody {
            agent_id: self.agent_id.clone(),
            patterns: self.patterns.clone(),
        }
    }
}

fn validate_agent_id(agent_id: String) -> Result<String, ClaimRequestError> {
    let trimmed = agent_id.trim();
    if trimmed.is_empty() {
        return Err(ClaimRequestError::EmptyAgentId);
    }
    Ok(trimmed.to_owned())
}

fn validate_patterns(patterns: Vec<String>) -> Result<Vec<String>, ClaimRequestError> {
    if patterns.is_empty() {
        return Err(ClaimRequestError::NoPatterns);
    }
    patterns
        .into_iter()
        .map(|p| {
            let trimmed = p.trim();
            if trimmed.is_empty() {
                Err(ClaimRequestError::BlankPattern)
            } else {
                Ok(trimmed.to_owned())
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ClaimVerdict {
    Granted { expires_at: String },
    Conflict { competitors: Vec<Competitor> },
}

impl ClaimVerdict {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimVerdict::Granted { .. })
    }
}

/// An existing claim that overlaps the requested patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Competitor {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub patterns: Vec<String>,
    pub description: String,
}

impl Competitor {
    /// `name (id)` when the server knows a display name, otherwise the id.
    pub fn display_name(&self) -> String {
        match self.agent_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("{name} ({})", self.agent_id),
            None => self.agent_id.clone(),
        }
    }
}

impl From<ClaimConflict> for Competitor {
    fn from(c: ClaimConflict) -> Self {
        Self {
            agent_id: c.agent_id,
            agent_name: c.agent_name,
            patterns: c.patterns,
            description: c.claim,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimProtocolError {
    #[error("claim response has no expires_at")]
    MissingExpiry,
    #[error("claim conflict response lists no competing claims")]
    EmptyConflict,
    #[error("unexpected claim response type {0:?}")]
    UnexpectedType(String),
}

pub fn verdict_from_response(resp: ClaimResponse) -> Result<ClaimVerdict, ClaimProtocolError> {
    match resp.r#type.as_deref() {
        Some(CLAIM_CONFLICT) => {
            if resp.conflicts.is_empty() {
                return Err(ClaimProtocolError::EmptyConflict);
            }
            Ok(ClaimVerdict::Conflict {
                competitors: resp.conflicts.into_iter().map(Competitor::from).collect(),
            })
        }
        other => match resp.expires_at.filter(|e| !e.trim().is_empty()) {
            Some(expires_at) => Ok(ClaimVerdict::Granted { expires_at }),
            None => match other {
                Some(t) if !t.is_empty() => Err(ClaimProtocolError::UnexpectedType(t.to_owned())),
                _ => Err(ClaimProtocolError::MissingExpiry),
            },
        },
    }
}
