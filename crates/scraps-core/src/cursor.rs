use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::event::Event;

/// Identifies one live-write line. Two agents writing the same path get two lines.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChunkKey {
    pub agent_id: String,
    pub path: String,
}

impl ChunkKey {
    pub fn new(agent_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.agent_id, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStreamState {
    pub last_version: i64,
    pub char_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CursorSignal {
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
}

impl CursorSignal {
    pub fn key(&self) -> &ChunkKey {
        match self {
            CursorSignal::Begin { key, .. }
            | CursorSignal::Update { key, .. }
            | CursorSignal::Finalize { key, .. } => key,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkCursorTracker {
    open: BTreeMap<ChunkKey, ChunkStreamState>,
}

impl ChunkCursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances cursor state for one classified event.
    ///
    /// For non-chunk events the returned finalize signals must be rendered
    /// before the event itself.
    pub fn observe(&mut self, event: &Event) -> Vec<CursorSignal> {
        let Event::Chunk(chunk) = event else {
            return match event.agent_id() {
                Some(agent) => self.finalize_where(|k| k.agent_id == agent),
                None => self.finalize_where(|_| true),
            };
        };

        let key = ChunkKey::new(chunk.agent_id.as_str(), chunk.path.as_str());
        match self.open.get_mut(&key) {
            Some(state) if chunk.cursor_version <= state.last_version => Vec::new(),
            Some(state) => {
                state.last_version = chunk.cursor_version;
                state.char_count = chunk.char_count;
                vec![CursorSignal::Update {
                    key,
                    version: chunk.cursor_version,
                    char_count: chunk.char_count,
                }]
            }
            None => {
                self.open.insert(
                    key.clone(),
                    ChunkStreamState {
                        last_version: chunk.cursor_version,
                        char_count: chunk.char_count,
                    },
                );
                vec![CursorSignal::Begin {
                    key,
                    char_count: chunk.char_count,
                }]
            }
        }
    }

    /// Finalizes every open line; used when the stream ends.
    pub fn close(&mut self) -> Vec<CursorSignal> {
        self.finalize_where(|_| true)
    }

    pub fn is_open(&self, key: &ChunkKey) -> bool {
        self.open.contains_key(key)
    }

    pub fn state(&self, key: &ChunkKey) -> Option<ChunkStreamState> {
        self.open.get(key).copied()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn finalize_where(&mut self, mut pred: impl FnMut(&ChunkKey) -> bool) -> Vec<CursorSignal> {
        if self.open.is_empty() {
            return Vec::new();
        }
        let (done, keep): (BTreeMap<_, _>, BTreeMap<_, _>) =
            std::mem::take(&mut self.open)
                .into_iter()
                .partition(|(k, _)| pred(k));
        self.open = keep;
        done.into_iter()
            .map(|(key, s)| CursorSignal::Finalize {
                key,
                char_count: s.char_count,
            })
            .collect()
    }
}
