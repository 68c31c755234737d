//! Error types for session engine operations.

/// Error type for session engine operations.
///
/// Lost creation races and unsafe identifiers are not errors: the former
/// joins the existing session, the latter fails safe by echoing the
/// original value.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The in-memory table is full and overflow sessions are disabled.
    #[error("No session available: in-memory capacity of {capacity} reached")]
    CapacityExhausted { capacity: usize },

    /// The access check callback refused the caller for this session.
    #[error("Unauthorized request for session {id}")]
    Unauthorized { id: String },

    /// The session was invalidated while the caller still held it.
    #[error("Session invalidated: {0}")]
    Invalidated(String),

    /// The id generator kept producing ids that already exist.
    #[error("Could not generate an unused session id after {attempts} attempts")]
    IdGeneration { attempts: u32 },

    /// Error from the backing tier.
    #[error("Backing store error: {0}")]
    Backing(String),

    /// A background thread could not be started.
    #[error("Failed to start background task: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for session engine operations.
pub type Result<T> = std::result::Result<T, SessionError>;
