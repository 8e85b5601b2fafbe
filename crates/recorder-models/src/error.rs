use thiserror::Error;

/// Failures surfaced by the record codecs and the run window query.
///
/// Malformed JSON payloads are deliberately absent: the codecs recover those
/// locally and hand back `None` so a single corrupt row cannot abort a bulk
/// read.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid event origin: {0}")]
    InvalidOrigin(String),
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),
    #[error("invalid state for {entity_id}: {reason}")]
    InvalidState { entity_id: String, reason: String },
    #[error("malformed {0} event payload")]
    MalformedEventData(String),
    #[error("event {0} is not a state_changed event")]
    NotStateChanged(String),
    #[error("recorder run needs to be persisted before querying it")]
    RunNotPersisted,
    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
