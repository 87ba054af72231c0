//! Streaming response assembly.
//!
//! One [`StreamingSession`] follows a single assistant response from its
//! first event to a terminal state:
//!
//! ```text
//!   pending -> streaming -> complete
//!                 |
//!                 +-------> error
//! ```
//!
//! Sessions only move forward. Once terminal, nothing mutates them again;
//! late or duplicate events are dropped with a log line. The registry keeps
//! a bounded tail of terminal sessions so stragglers after completion are
//! still recognized instead of resurrecting the response.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

/// Terminal sessions retained for late-event detection.
const TERMINAL_RETAIN: usize = 256;

/// Lifecycle state of one streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Announced but no content yet.
    Pending,
    /// At least one chunk applied.
    Streaming,
    /// Finished successfully.
    Complete,
    /// Failed, locally or server-side.
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Streaming => write!(f, "streaming"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Assembly state for one in-flight assistant response.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub response_id: String,
    /// Content assembled so far.
    pub accumulated: String,
    /// Highest sequence number applied; `None` before the first chunk.
    pub last_seq: Option<u64>,
    pub state: SessionState,
}

impl StreamingSession {
    fn new(response_id: &str) -> Self {
        Self {
            response_id: response_id.to_string(),
            accumulated: String::new(),
            last_seq: None,
            state: SessionState::Pending,
        }
    }
}

/// All live and recently finished streaming sessions.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    sessions: HashMap<String, StreamingSession>,
    terminal_order: VecDeque<String>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a response. Returns true when a new session was created.
    ///
    /// Repeated announcements for a live session are no-ops; a terminal
    /// session is never restarted.
    pub fn start(&mut self, response_id: &str) -> bool {
        if let Some(existing) = self.sessions.get(response_id) {
            if existing.state.is_terminal() {
                warn!("stream start for finished response {response_id}, ignoring");
            } else {
                debug!("stream start repeated for response {response_id}");
            }
            return false;
        }

        self.sessions
            .insert(response_id.to_string(), StreamingSession::new(response_id));
        true
    }

    /// Append one chunk. Returns the full accumulated content when the
    /// chunk was applied, `None` when it was dropped.
    ///
    /// A chunk for an unknown response opens a session implicitly; the
    /// announce event may have been lost. Chunks at or below `last_seq`
    /// are duplicates. A gap in the sequence is logged but applied; the
    /// transport does not re-deliver and partial content beats none.
    pub fn apply_chunk(&mut self, response_id: &str, chunk: &str, seq: u64) -> Option<&str> {
        let session = self
            .sessions
            .entry(response_id.to_string())
            .or_insert_with(|| {
                debug!("chunk for unannounced response {response_id}, opening session");
                StreamingSession::new(response_id)
            });

        if session.state.is_terminal() {
            warn!(
                "dropping chunk seq {seq} for {} response {response_id}",
                session.state
            );
            return None;
        }

        if let Some(last) = session.last_seq {
            if seq <= last {
                debug!("dropping duplicate chunk seq {seq} for response {response_id} (at {last})");
                return None;
            }
            if seq > last + 1 {
                warn!(
                    "chunk gap for response {response_id}: jumped from seq {last} to {seq}"
                );
            }
        } else if seq > 0 {
            warn!("response {response_id} starts at seq {seq}, expected 0");
        }

        session.accumulated.push_str(chunk);
        session.last_seq = Some(seq);
        session.state = SessionState::Streaming;
        Some(session.accumulated.as_str())
    }

    /// Finish a response. Returns its final content, with `final_content`
    /// replacing the accumulation when the server provides one.
    ///
    /// Unknown or already terminal responses return `None`.
    pub fn complete(&mut self, response_id: &str, final_content: Option<String>) -> Option<&str> {
        let session = match self.sessions.get_mut(response_id) {
            Some(session) if !session.state.is_terminal() => session,
            Some(session) => {
                warn!(
                    "stream complete for {} response {response_id}, ignoring",
                    session.state
                );
                return None;
            }
            None => {
                warn!("stream complete for unknown response {response_id}, ignoring");
                return None;
            }
        };

        if let Some(content) = final_content {
            session.accumulated = content;
        }
        session.state = SessionState::Complete;
        self.note_terminal(response_id);
        self.sessions.get(response_id).map(|s| s.accumulated.as_str())
    }

    /// Fail a response. Returns false for unknown or already terminal ids.
    pub fn error(&mut self, response_id: &str, reason: &str) -> bool {
        let Some(session) = self.sessions.get_mut(response_id) else {
            warn!("stream error for unknown response {response_id}, ignoring");
            return false;
        };
        if session.state.is_terminal() {
            warn!(
                "stream error for {} response {response_id}, ignoring: {reason}",
                session.state
            );
            return false;
        }
        debug!("response {response_id} errored: {reason}");
        session.state = SessionState::Error;
        self.note_terminal(response_id);
        true
    }

    /// Force every non-terminal session into `error`. Returns their ids.
    ///
    /// Runs when the connection drops: the server will not resume a stream
    /// across connections, so whatever was in flight is gone.
    pub fn fail_open_sessions(&mut self, reason: &str) -> Vec<String> {
        let open: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.response_id.clone())
            .collect();

        for response_id in &open {
            warn!("invalidating in-flight response {response_id}: {reason}");
            if let Some(session) = self.sessions.get_mut(response_id) {
                session.state = SessionState::Error;
            }
            self.note_terminal(response_id);
        }
        open
    }

    pub fn session(&self, response_id: &str) -> Option<&StreamingSession> {
        self.sessions.get(response_id)
    }

    /// Number of sessions that are not yet terminal.
    pub fn open_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.state.is_terminal())
            .count()
    }

    fn note_terminal(&mut self, response_id: &str) {
        self.terminal_order.push_back(response_id.to_string());
        while self.terminal_order.len() > TERMINAL_RETAIN {
            if let Some(oldest) = self.terminal_order.pop_front() {
                let still_terminal = self
                    .sessions
                    .get(&oldest)
                    .map(|s| s.state.is_terminal())
                    .unwrap_or(false);
                if still_terminal {
                    self.sessions.remove(&oldest);
                }
            }
        }
    }
}
