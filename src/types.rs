use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque interaction identity, monotonically assigned per engine instance.
pub type InteractionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    Pending,
    Completed,
    Cancelled,
    Rejected,
}

impl InteractionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InteractionState::Pending)
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    /// False when the interaction was missing or already terminal.
    pub cancelled: bool,
    /// True when the cancelled interaction had already been delivered into
    /// the session (an interrupt was attempted).
    pub was_active: bool,
}

/// A network-reachable endpoint exposing the live terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub url: String,
}

/// Point-in-time engine status returned by `snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub started_at: DateTime<Utc>,
    pub closed: bool,
    pub interaction_count: u64,
    pub last_interaction_id: Option<InteractionId>,
    pub pid: Option<u32>,
    pub notification_count: u64,
    pub last_notification: Option<String>,
    pub views: Vec<View>,
}
