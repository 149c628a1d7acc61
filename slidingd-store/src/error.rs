#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadArgument(String),

    #[error("set does not exist")]
    NotFound,

    #[error("set already exists")]
    Exists,

    #[error("set is pending deletion")]
    DeleteInProgress,

    #[error("set is not proxied")]
    NotProxied,

    #[error(transparent)]
    Hll(#[from] slidingd_hll::Error),

    #[error(transparent)]
    Db(#[from] rocksdb::Error),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
