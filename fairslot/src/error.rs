use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, FairslotError>;

/// Errors that can occur in the allocation engine.
#[derive(Debug, Error)]
pub enum FairslotError {
    /// Malformed input at the boundary
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The operation conflicts with the current state of a slot, request or quota
    #[error("Conflict: {0}")]
    Conflict(Conflict),

    /// Unknown requester, slot, request or reservation
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// A state machine refused a transition. Indicates a bug or a stale read.
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: &'static str,
        to: &'static str,
    },

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The specific conflict behind a [`FairslotError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("slot is not available")]
    SlotUnavailable,
    #[error("an active request for this slot already exists")]
    DuplicateRequest,
    #[error("weekly quota exceeded")]
    QuotaExceeded,
    #[error("slot has pending requests awaiting allocation")]
    PendingContestExists,
    #[error("already cancelled")]
    AlreadyCancelled,
    #[error("slot overlaps an existing slot on the same resource")]
    SlotOverlap,
    #[error("slot already holds an active reservation")]
    ActiveReservationExists,
}

/// Coarse error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Internal,
}

impl FairslotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FairslotError::Validation(_) => ErrorKind::Validation,
            FairslotError::Conflict(_) => ErrorKind::Conflict,
            FairslotError::NotFound { .. } => ErrorKind::NotFound,
            FairslotError::InvalidTransition { .. } => ErrorKind::Internal,
            #[cfg(feature = "postgres")]
            FairslotError::Database(_) => ErrorKind::Internal,
            FairslotError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Returns the conflict, if this is a conflict error.
    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            FairslotError::Conflict(c) => Some(*c),
            _ => None,
        }
    }

    pub(crate) fn not_found(resource: &'static str, id: impl ToString) -> Self {
        FairslotError::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

impl From<Conflict> for FairslotError {
    fn from(conflict: Conflict) -> Self {
        FairslotError::Conflict(conflict)
    }
}
