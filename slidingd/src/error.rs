use slidingd_store::Error as StoreError;

/// Wire-level reply errors, rendered as `-<text>\r\n`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplyError {
    #[error("Set does not exist")]
    NotFound,

    #[error("Set exists")]
    Exists,

    #[error("Delete in progress")]
    DeleteInProgress,

    #[error("Set is not proxied. Close it first.")]
    NotProxied,

    #[error("Client Error: {0}")]
    Client(String),

    #[error("Internal Error")]
    Internal,
}

impl ReplyError {
    pub fn bad_args() -> Self {
        Self::Client("Bad arguments".to_owned())
    }

    /// Internal errors additionally close the connection after the reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal)
    }
}

impl From<StoreError> for ReplyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Exists => Self::Exists,
            StoreError::DeleteInProgress => Self::DeleteInProgress,
            StoreError::NotProxied => Self::NotProxied,
            StoreError::BadArgument(detail) => Self::Client(detail),
            StoreError::Hll(err) => match err {
                slidingd_hll::Error::PrecisionOutOfRange
                | slidingd_hll::Error::ErrorRateOutOfRange
                | slidingd_hll::Error::PrecisionMismatch => Self::Client(err.to_string()),
                // corrupt or unreadable persisted state is not the client's fault
                slidingd_hll::Error::UnsupportedVersion(_)
                | slidingd_hll::Error::BufferOverflow
                | slidingd_hll::Error::Truncated => Self::Internal,
            },
            StoreError::Db(_) | StoreError::Internal(_) => Self::Internal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
