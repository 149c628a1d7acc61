//! Sliding HyperLogLog: cardinality estimation over a trailing time window.
//!
//! Every observed key is hashed once; the hash either lands in a flat list of
//! `(timestamp, hash)` points ([`sparse`]) or in one of `2^precision`
//! registers holding timestamped leading-zero samples ([`dense`]). Either
//! form can answer "how many distinct keys in the last `w` seconds".

pub mod dense;
pub mod estimate;
pub mod hash;
pub mod serialize;
pub mod sparse;

mod constants;

/// 16 registers
pub const MIN_PRECISION: u8 = 4;
/// 262,144 registers
pub const MAX_PRECISION: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("precision must be between 4 and 18")]
    PrecisionOutOfRange,

    #[error("error rate must be within (0, 1) and achievable by some precision")]
    ErrorRateOutOfRange,

    #[error("sets must share the same precision")]
    PrecisionMismatch,

    #[error("unsupported serialization version {0}")]
    UnsupportedVersion(u32),

    #[error("write past the end of the serialization buffer")]
    BufferOverflow,

    #[error("serialized data is truncated or malformed")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, Error>;
