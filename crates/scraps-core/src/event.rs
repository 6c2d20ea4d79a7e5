//! Classification of live feed records into domain events.
//!
//! The server's payload shapes drift between versions, so every record is read
//! leniently: a known `type` whose payload does not fit degrades to
//! [`Event::Unknown`] exactly like an unknown `type` does.

use std::fmt;
use std::str::FromStr;

use scraps_protocol as proto;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Commit(CommitEvent),
    Branch(BranchEvent),
    Presence(PresenceEvent),
    ClaimActivity(ClaimActivityEvent),
    Chunk(ChunkEvent),
    Unknown { raw: Value },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitEvent {
    pub sha: String,
    pub message: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub action: FileAction,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Add,
    Delete,
    Modify,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchEvent {
    pub kind: BranchKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_sha: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchKind {
    Create,
    Delete,
    Update,
    RefUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEvent {
    pub agent_id: String,
    pub role: String,
    pub joined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimActivityEvent {
    pub kind: ClaimActivityKind,
    pub agent_id: String,
    pub patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimActivityKind {
    Claim,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkEvent {
    pub agent_id: String,
    pub path: String,
    pub cursor_version: i64,
    pub char_count: i64,
}

/// Coarse event category used by the watch filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Commit,
    Branch,
    Presence,
    Claim,
    Chunk,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Commit,
        EventKind::Branch,
        EventKind::Presence,
        EventKind::Claim,
        EventKind::Chunk,
        EventKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Commit => "commit",
            EventKind::Branch => "branch",
            EventKind::Presence => "presence",
            EventKind::Claim => "claim",
            EventKind::Chunk => "chunk",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0} (expected one of commit, branch, presence, claim, chunk, unknown)")]
pub struct ParseEventKindError(String);

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ParseEventKindError(s.to_owned()))
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Commit(_) => EventKind::Commit,
            Event::Branch(_) => EventKind::Branch,
            Event::Presence(_) => EventKind::Presence,
            Event::ClaimActivity(_) => EventKind::Claim,
            Event::Chunk(_) => EventKind::Chunk,
            Event::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// The agent this event is attributed to, when the payload names one.
    pub fn agent_id(&self) -> Option<&str> {
        let id = match self {
            Event::Presence(p) => p.agent_id.as_str(),
            Event::ClaimActivity(c) => c.agent_id.as_str(),
            Event::Chunk(c) => c.agent_id.as_str(),
            Event::Commit(_) | Event::Branch(_) | Event::Unknown { .. } => return None,
        };
        (!id.is_empty()).then_some(id)
    }

    pub fn render(&self) -> RenderedEvent {
        match self {
            Event::Commit(c) => {
                let mut summary = truncate(&c.message, 40);
                if !c.sha.is_empty() {
                    summary = format!("{} {summary}", short_sha(&c.sha));
                }
                if let Some(author) = &c.author {
                    summary = format!("{summary} ({author})");
                }
                RenderedEvent {
                    label: "COMMIT".to_owned(),
                    summary,
                    details: c
                        .files
                        .iter()
                        .map(|f| format!("{} {}", f.action.marker(), f.path))
                        .collect(),
                }
            }
            Event::Branch(b) => RenderedEvent {
                label: b.kind.label().to_owned(),
                summary: b.name.clone(),
                details: Vec::new(),
            },
            Event::Presence(p) => {
                let summary = if p.role.is_empty() {
                    p.agent_id.clone()
                } else {
                    format!("{} ({})", p.agent_id, p.role)
                };
                RenderedEvent {
                    label: if p.joined { "JOIN" } else { "LEAVE" }.to_owned(),
                    summary,
                    details: Vec::new(),
                }
            }
            Event::ClaimActivity(c) => {
                let mut summary = c.agent_id.clone();
                if let Some(desc) = c.description.as_deref().filter(|d| !d.is_empty()) {
                    summary = format!("{summary} - {}", truncate(desc, 30));
                }
                RenderedEvent {
                    label: match c.kind {
                        ClaimActivityKind::Claim => "CLAIM",
                        ClaimActivityKind::Release => "RELEASE",
                    }
                    .to_owned(),
                    summary,
                    details: c.patterns.clone(),
                }
            }
            Event::Chunk(c) => RenderedEvent {
                label: "WRITE".to_owned(),
                summary: format!("{} {} ({} chars)", c.agent_id, c.path, c.char_count),
                details: Vec::new(),
            },
            Event::Unknown { raw } => {
                let label = raw
                    .get("type")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| "EVENT".to_owned());
                RenderedEvent {
                    label,
                    summary: truncate(&raw.to_string(), 120),
                    details: Vec::new(),
                }
            }
        }
    }
}

/// Presentation-neutral text for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEvent {
    pub label: String,
    pub summary: String,
    pub details: Vec<String>,
}

impl RenderedEvent {
    pub fn matches_text(&self, needle_lower: &str) -> bool {
        if needle_lower.is_empty() {
            return true;
        }
        let haystack = format!(
            "{} {} {}",
            self.label,
            self.summary,
            self.details.join("\n")
        )
        .to_lowercase();
        haystack.contains(needle_lower)
    }
}

impl FileAction {
    fn from_wire(action: Option<&str>) -> Self {
        match action.unwrap_or_default() {
            "add" => FileAction::Add,
            "delete" => FileAction::Delete,
            "modify" => FileAction::Modify,
            other => FileAction::Other(other.to_owned()),
        }
    }

    pub fn marker(&self) -> char {
        match self {
            FileAction::Add => '+',
            FileAction::Delete => '-',
            FileAction::Modify => '~',
            FileAction::Other(_) => ' ',
        }
    }
}

impl BranchKind {
    pub fn label(self) -> &'static str {
        match self {
            BranchKind::Create => "BRANCH:CREATE",
            BranchKind::Delete => "BRANCH:DELETE",
            BranchKind::Update => "BRANCH:UPDATE",
            BranchKind::RefUpdate => "REF:UPDATE",
        }
    }
}

pub fn classify(value: &Value) -> Event {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Event::Unknown { raw: value.clone() };
    };

    let event = match kind {
        proto::EVT_COMMIT => payload(value).map(commit_event),
        proto::EVT_BRANCH_CREATE => payload(value).and_then(|p| branch_event(p, BranchKind::Create)),
        proto::EVT_BRANCH_DELETE => payload(value).and_then(|p| branch_event(p, BranchKind::Delete)),
        proto::EVT_BRANCH_UPDATE => payload(value).and_then(|p| branch_event(p, BranchKind::Update)),
        proto::EVT_REF_UPDATE => payload(value).and_then(|p| branch_event(p, BranchKind::RefUpdate)),
        proto::EVT_AGENT_JOIN => payload(value).and_then(|p| presence_event(p, true)),
        proto::EVT_AGENT_LEAVE => payload(value).and_then(|p| presence_event(p, false)),
        proto::EVT_ACTIVITY => payload(value).and_then(activity_event),
        proto::EVT_AGENT_CLAIM => {
            payload(value).map(|p| agent_claim_event(p, ClaimActivityKind::Claim))
        }
        proto::EVT_AGENT_RELEASE => {
            payload(value).map(|p| agent_claim_event(p, ClaimActivityKind::Release))
        }
        proto::EVT_FILE_CHUNK => payload(value).and_then(chunk_event),
        _ => None,
    };

    event.unwrap_or_else(|| Event::Unknown { raw: value.clone() })
}

fn payload<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

/// Returns the first candidate that is present and non-empty, in priority order.
pub fn first_non_empty<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Branch name resolution: `branch`, then `name`, then `ref`.
pub fn resolve_branch_name(p: &proto::BranchPayload) -> Option<&str> {
    first_non_empty([p.branch.as_deref(), p.name.as_deref(), p.r#ref.as_deref()])
}

/// Author display name: structured `author.name`, then a raw `author` string.
pub fn resolve_author(author: Option<&proto::AuthorField>) -> Option<&str> {
    let (structured, raw) = match author? {
        proto::AuthorField::Structured(obj) => (obj.name.as_deref(), None),
        proto::AuthorField::Raw(s) => (None, Some(s.as_str())),
    };
    first_non_empty([structured, raw])
}

fn commit_event(p: proto::CommitPayload) -> Event {
    let sha = first_non_empty([p.sha.as_deref(), p.commit.as_deref()])
        .unwrap_or_default()
        .to_owned();
    let author = resolve_author(p.author.as_ref()).map(str::to_owned);
    let files = p
        .files
        .unwrap_or_default()
        .into_iter()
        .filter_map(|f| {
            let path = f.path.filter(|s| !s.is_empty())?;
            Some(FileChange {
                action: FileAction::from_wire(f.action.as_deref()),
                path,
            })
        })
        .collect();

    Event::Commit(CommitEvent {
        sha,
        message: p.message.unwrap_or_default(),
        branch: p.branch.unwrap_or_default(),
        author,
        files,
    })
}

fn branch_event(p: proto::BranchPayload, kind: BranchKind) -> Option<Event> {
    let name = resolve_branch_name(&p)?.to_owned();
    let new_sha = first_non_empty([p.new_sha.as_deref(), p.sha.as_deref()]).map(str::to_owned);
    let old_sha = first_non_empty([p.old_sha.as_deref()]).map(str::to_owned);
    Some(Event::Branch(BranchEvent {
        kind,
        name,
        old_sha,
        new_sha,
    }))
}

fn presence_event(p: proto::PresencePayload, joined: bool) -> Option<Event> {
    let agent_id = first_non_empty([p.agent_id.as_deref(), p.agent_name.as_deref()])?.to_owned();
    Some(Event::Presence(PresenceEvent {
        agent_id,
        role: p.role.unwrap_or_default(),
        joined,
    }))
}

fn activity_event(p: proto::ActivityPayload) -> Option<Event> {
    let activity = p.activity?;
    let kind = match activity.r#type.as_deref()? {
        proto::ACTIVITY_CLAIM => ClaimActivityKind::Claim,
        proto::ACTIVITY_RELEASE => ClaimActivityKind::Release,
        _ => return None,
    };
    Some(Event::ClaimActivity(ClaimActivityEvent {
        kind,
        agent_id: activity.agent_id.unwrap_or_default(),
        patterns: activity.patterns.unwrap_or_default(),
        description: first_non_empty([activity.claim.as_deref()]).map(str::to_owned),
    }))
}

fn agent_claim_event(p: proto::AgentClaimPayload, kind: ClaimActivityKind) -> Event {
    Event::ClaimActivity(ClaimActivityEvent {
        kind,
        agent_id: p.agent_id.unwrap_or_default(),
        patterns: p.patterns.unwrap_or_default(),
        description: first_non_empty([p.claim.as_deref(), p.reason.as_deref()]).map(str::to_owned),
    })
}

fn chunk_event(p: proto::FileChunkPayload) -> Option<Event> {
    let agent_id = first_non_empty([p.agent_id.as_deref()])?.to_owned();
    let path = first_non_empty([p.path.as_deref()])?.to_owned();
    let content_len = p.content.as_deref().map(|c| c.chars().count() as i64);
    let cursor_version = p.version.or(content_len)?;
    Some(Event::Chunk(ChunkEvent {
        agent_id,
        path,
        cursor_version,
        char_count: content_len.unwrap_or(cursor_version),
    }))
}

/// Display form of a commit SHA: the first 7 characters.
pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(7) {
        Some((idx, _)) => &sha[..idx],
        None => sha,
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let take = max - 3;
    let mut it = s.chars();
    let prefix: String = it.by_ref().take(take).collect();
    let rest: Vec<char> = it.collect();
    if rest.len() <= 3 {
        return format!("{prefix}{}", rest.into_iter().collect::<String>());
    }
    format!("{prefix}...")
}
