use crate::types::InteractionId;

/// Typed failures surfaced by the interaction engine.
///
/// Clone is required because a cached launch failure is re-surfaced to every
/// current and future caller until the engine instance is replaced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine is closed")]
    Closed,

    #[error("unknown interaction id {0}")]
    UnknownInteraction(InteractionId),

    #[error("session launch failed: {0}")]
    Launch(String),

    #[error("input delivery failed: {0}")]
    Delivery(String),

    #[error("interaction cancelled: {0}")]
    Cancelled(String),
}
