use thiserror::Error;

/// The runtime's error taxonomy (see §7 of the design spec).
///
/// Kept flat and stringly-typed for the bespoke variants, matching how
/// operator and handler code reports context at the point of failure.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("cannot allocate buffer: {0}")]
    CannotAllocateBuffer(String),

    #[error("cannot serialize frame: {0}")]
    CannotSerialize(String),

    #[error("cannot deserialize frame: {0}")]
    CannotDeserialize(String),

    #[error("operation not implemented: {0}")]
    NotImplemented(String),

    #[error("sequence shredder: admission outside ABA window for sequence {0}")]
    NotInRange(u64),

    #[error("network channel lost: {0}")]
    ChannelLost(String),

    #[error("invalid query status: {0}")]
    InvalidQueryStatus(String),

    #[error("query not found: {0}")]
    QueryNotFound(String),

    #[error("handler index {0} not registered")]
    HandlerNotFound(usize),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
