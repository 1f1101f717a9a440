use thiserror::Error;

/// Failure reported by an event store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("event store query failed: {0}")]
    Query(String),

    #[error("event store misconfigured: {0}")]
    Configuration(String),
}

/// Outcome of a failed poll or refetch.
///
/// Transient errors are retried on the next cycle from the same checkpoint.
/// Configuration errors stop the owning source task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("transient poll failure: {0}")]
    Transient(String),

    #[error("poll configuration error: {0}")]
    Configuration(String),
}

impl PollError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PollError::Configuration(_))
    }
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Query(msg) => PollError::Transient(msg),
            StoreError::Configuration(msg) => PollError::Configuration(msg),
        }
    }
}

/// Downstream cache boundary rejected a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalidation rejected: {0}")]
pub struct ServiceError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("control filter unavailable: {0}")]
pub struct ControlError(pub String);

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl NotifyError {
    /// Whether the owning source task must stop rather than retry next cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            NotifyError::Poll(err) => err.is_fatal(),
            NotifyError::Config(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_classify_into_poll_errors() {
        let transient: PollError = StoreError::Unavailable("timeout".into()).into();
        assert!(!transient.is_fatal());

        let query: PollError = StoreError::Query("ORA-01555".into()).into();
        assert_eq!(query, PollError::Transient("ORA-01555".into()));

        let fatal: PollError = StoreError::Configuration("no such table".into()).into();
        assert!(fatal.is_fatal());
    }

    #[test]
    fn only_configuration_problems_are_fatal() {
        assert!(NotifyError::from(PollError::Configuration("bad table".into())).is_fatal());
        assert!(!NotifyError::from(PollError::Transient("timeout".into())).is_fatal());
        assert!(!NotifyError::from(ServiceError("cache down".into())).is_fatal());
    }
}
