//! Watch session state machine.
//!
//! `reduce` is pure: the runtime feeds it messages from the supervisor and the
//! keyboard and prints whatever signals come back.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::connection::ConnectionState;
use crate::cursor::{ChunkCursorTracker, ChunkKey, CursorSignal};
use crate::event::{Event, EventKind, RenderedEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Live,
    Degraded(String),
    Closed,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Degraded(_) => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

/// Case-insensitive text match plus an optional set of event kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    text: String,
    kinds: BTreeSet<EventKind>,
}

impl WatchFilter {
    pub fn new(text: &str, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            text: text.trim().to_lowercase(),
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.trim().to_lowercase(),
            kinds: BTreeSet::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kinds(&self) -> &BTreeSet<EventKind> {
        &self.kinds
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.kinds.is_empty()
    }

    pub fn matches(&self, kind: EventKind, rendered: &RenderedEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&kind)) && rendered.matches_text(&self.text)
    }
}

#[derive(Debug)]
pub struct WatchModel {
    pub state: SessionState,
    pub connection: ConnectionState,
    pub filter: WatchFilter,
    pub show_claims: bool,
    pub events_seen: u64,
    pub warnings: u64,
    tracker: ChunkCursorTracker,
    shown: BTreeSet<ChunkKey>,
}

impl WatchModel {
    pub fn new(filter: WatchFilter, show_claims: bool) -> Self {
        Self {
            state: SessionState::Connecting,
            connection: ConnectionState::Idle,
            filter,
            show_claims,
            events_seen: 0,
            warnings: 0,
            tracker: ChunkCursorTracker::new(),
            shown: BTreeSet::new(),
        }
    }

    pub fn tracker(&self) -> &ChunkCursorTracker {
        &self.tracker
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn is_visible(&self, event: &Event, rendered: &RenderedEvent) -> bool {
        if !self.show_claims && event.kind() == EventKind::Claim {
            return false;
        }
        self.filter.matches(event.kind(), rendered)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Connecting,
    Connected,
    Event(Event),
    Disconnected {
        attempt: u32,
        retry_in: Duration,
        now: Instant,
        reason: String,
    },
    DecodeWarning(String),
    Fatal(String),
    Cancelled,
    SetFilter(String),
    SetKinds(BTreeSet<EventKind>),
    ToggleClaims,
    Notice(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Line {
        label: String,
        summary: String,
        details: Vec<String>,
        event: Event,
    },
    Begin {
        key: ChunkKey,
        char_count: i64,
    },
    Update {
        key: ChunkKey,
        version: i64,
        char_count: i64,
    },
    Finalize {
        key: ChunkKey,
        char_count: i64,
    },
    Status {
        state: SessionState,
        message: String,
    },
    Warning {
        message: String,
    },
}

pub fn reduce(mut model: WatchModel, msg: Msg) -> (WatchModel, Vec<Signal>) {
    let mut signals = Vec::new();

    if model.is_closed() {
        return (model, signals);
    }

    match msg {
        Msg::Connecting => {
            model.connection = model.connection.connecting();
        }
        Msg::Connected => {
            model.connection = model.connection.connected();
            go_live(&mut model, "connected", &mut signals);
        }
        Msg::Event(event) => {
            model.events_seen = model.events_seen.saturating_add(1);
            if !model.connection.is_connected() {
                model.connection = model.connection.connected();
            }
            go_live(&mut model, "receiving events", &mut signals);
            apply_event(&mut model, event, &mut signals);
        }
        Msg::Disconnected {
            attempt,
            retry_in,
            now,
            reason,
        } => {
            finalize_all(&mut model, &mut signals);
            model.connection = model.connection.backoff(attempt, now + retry_in);
            model.state = SessionState::Degraded(reason.clone());
            signals.push(Signal::Status {
                state: model.state.clone(),
                message: format!(
                    "disconnected ({reason}); reconnecting in {}ms",
                    retry_in.as_millis()
                ),
            });
        }
        Msg::DecodeWarning(message) => {
            model.warnings = model.warnings.saturating_add(1);
            signals.push(Signal::Warning { message });
        }
        Msg::Fatal(message) => close(&mut model, message, &mut signals),
        Msg::Cancelled => close(&mut model, "cancelled".to_owned(), &mut signals),
        Msg::SetFilter(text) => {
            model.filter = WatchFilter::new(&text, model.filter.kinds.clone());
            let message = if model.filter.text.is_empty() {
                "filter cleared".to_owned()
            } else {
                format!("filter: {}", model.filter.text)
            };
            status(&model, message, &mut signals);
        }
        Msg::SetKinds(kinds) => {
            let message = if kinds.is_empty() {
                "showing all event kinds".to_owned()
            } else {
                let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                format!("showing {}", names.join(", "))
            };
            model.filter.kinds = kinds;
            status(&model, message, &mut signals);
        }
        Msg::ToggleClaims => {
            model.show_claims = !model.show_claims;
            let message = if model.show_claims {
                "claim activity shown"
            } else {
                "claim activity hidden"
            };
            status(&model, message.to_owned(), &mut signals);
        }
        Msg::Notice(message) => status(&model, message, &mut signals),
    }

    (model, signals)
}

fn go_live(model: &mut WatchModel, message: &str, signals: &mut Vec<Signal>) {
    if model.state == SessionState::Live {
        return;
    }
    model.state = SessionState::Live;
    status(model, message.to_owned(), signals);
}

fn status(model: &WatchModel, message: String, signals: &mut Vec<Signal>) {
    signals.push(Signal::Status {
        state: model.state.clone(),
        message,
    });
}

fn close(model: &mut WatchModel, message: String, signals: &mut Vec<Signal>) {
    finalize_all(model, signals);
    model.connection = model.connection.close();
    model.state = SessionState::Closed;
    status(model, message, signals);
}

fn finalize_all(model: &mut WatchModel, signals: &mut Vec<Signal>) {
    let closed = model.tracker.close();
    push_cursor_signals(model, closed, false, signals);
}

fn apply_event(model: &mut WatchModel, event: Event, signals: &mut Vec<Signal>) {
    // The tracker sees every event; visibility only decides what gets printed.
    let cursor = model.tracker.observe(&event);
    let rendered = event.render();
    let visible = model.is_visible(&event, &rendered);

    push_cursor_signals(model, cursor, visible, signals);

    if matches!(event, Event::Chunk(_)) || !visible {
        return;
    }
    signals.push(Signal::Line {
        label: rendered.label,
        summary: rendered.summary,
        details: rendered.details,
        event,
    });
}

fn push_cursor_signals(
    model: &mut WatchModel,
    cursor: Vec<CursorSignal>,
    chunk_visible: bool,
    signals: &mut Vec<Signal>,
) {
    for signal in cursor {
        match signal {
            CursorSignal::Begin { key, char_count } => {
                if chunk_visible {
                    model.shown.insert(key.clone());
                    signals.push(Signal::Begin { key, char_count });
                }
            }
            CursorSignal::Update {
                key,
                version,
                char_count,
            } => {
                if !chunk_visible {
                    continue;
                }
                if model.shown.contains(&key) {
                    signals.push(Signal::Update {
                        key,
                        version,
                        char_count,
                    });
                } else {
                    model.shown.insert(key.clone());
                    signals.push(Signal::Begin { key, char_count });
                }
            }
            CursorSignal::Finalize { key, char_count } => {
                if model.shown.remove(&key) {
                    signals.push(Signal::Finalize { key, char_count });
                }
            }
        }
    }
}
