use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Backoff {
        attempt: u32,
        next_retry_at: Instant,
    },
    Closed,
}

impl ConnectionState {
    pub fn connecting(self) -> Self {
        self.advance(ConnectionState::Connecting)
    }

    pub fn connected(self) -> Self {
        self.advance(ConnectionState::Connected)
    }

    pub fn backoff(self, attempt: u32, next_retry_at: Instant) -> Self {
        self.advance(ConnectionState::Backoff {
            attempt,
            next_retry_at,
        })
    }

    pub fn close(self) -> Self {
        ConnectionState::Closed
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Closed is terminal: nothing reopens a session once the user cancelled it.
    fn advance(self, next: ConnectionState) -> Self {
        if self.is_closed() {
            self
        } else {
            next
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Backoff { attempt, .. } => write!(f, "reconnecting (attempt {})", attempt + 1),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}
