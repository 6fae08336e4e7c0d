//! Error types for the VERSO versioned object store.
//!
//! One variant per exported result code, with structured payloads where the
//! engine needs to pass a value alongside the code (buffer sizing, epochs,
//! offending flags). [`RawCode`] carries the stable numeric values consumed
//! by callers that speak the numeric protocol.

use thiserror::Error;

/// Primary error type for VERSO operations.
#[derive(Error, Debug)]
pub enum VosError {
    /// The requested object, key, or record does not exist.
    ///
    /// Absence is distinct from a visible tombstone: a punched entry yields
    /// an empty result with `Ok`, never `NonExist`.
    #[error("entry does not exist")]
    NonExist,

    /// Invalid argument or malformed descriptor.
    #[error("invalid argument: {detail}")]
    Inval { detail: String },

    /// Memory allocation failed.
    #[error("out of memory")]
    NoMem,

    /// Operation on an invalid or closed handle.
    #[error("invalid handle")]
    NoHandle,

    /// Caller buffer too small; `required` is the size needed for a retry.
    #[error("buffer too small: {required} bytes required")]
    Overflow { required: u64 },

    /// The entry already exists and cannot be replaced.
    #[error("entry already exists")]
    Exist,

    /// Media I/O failure.
    #[error("I/O error: {detail}")]
    Io { detail: String },

    /// Malformed on-media image (bad magic, version, or checksum).
    #[error("invalid on-media format: {detail}")]
    IoInval { detail: String },

    /// Permission denied.
    #[error("permission denied")]
    NoPerm,

    /// The PM arena or NVMe blob is out of space.
    #[error("no space on storage target")]
    NoSpace,

    /// Blocked by an uncommitted distributed transaction; the caller may
    /// retry after the DTX layer resolves the entry.
    #[error("conflicting modification in progress")]
    InProgress,

    /// Resource is busy (held object, active iterator).
    #[error("resource is busy")]
    Busy,

    /// The operation was cancelled; any open transaction was aborted.
    #[error("operation cancelled")]
    Cancelled,

    /// Record truncated.
    #[error("record truncated: expected {expected} bytes, got {actual}")]
    Trunc { expected: u64, actual: u64 },

    /// Protocol mismatch (incompatible pool/blob version).
    #[error("protocol error: {detail}")]
    Proto { detail: String },

    /// Transient failure; retry the operation.
    #[error("try again")]
    Again,

    /// Subsystem used before initialization.
    #[error("uninitialized")]
    Uninit,
}

/// Stable numeric result codes.
///
/// These values are part of the exported interface and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RawCode {
    NonExist = 1005,
    Inval = 1003,
    NoMem = 1009,
    NoHandle = 1002,
    Overflow = 1004,
    Exist = 1006,
    Io = 1014,
    IoInval = 1015,
    NoPerm = 1001,
    NoSpace = 1007,
    InProgress = 1013,
    Busy = 1012,
    Cancelled = 1016,
    Trunc = 1011,
    Proto = 1017,
    Again = 1008,
    Uninit = 1018,
}

impl VosError {
    /// Map this error to its stable numeric code.
    pub const fn raw_code(&self) -> RawCode {
        match self {
            Self::NonExist => RawCode::NonExist,
            Self::Inval { .. } => RawCode::Inval,
            Self::NoMem => RawCode::NoMem,
            Self::NoHandle => RawCode::NoHandle,
            Self::Overflow { .. } => RawCode::Overflow,
            Self::Exist => RawCode::Exist,
            Self::Io { .. } => RawCode::Io,
            Self::IoInval { .. } => RawCode::IoInval,
            Self::NoPerm => RawCode::NoPerm,
            Self::NoSpace => RawCode::NoSpace,
            Self::InProgress => RawCode::InProgress,
            Self::Busy => RawCode::Busy,
            Self::Cancelled => RawCode::Cancelled,
            Self::Trunc { .. } => RawCode::Trunc,
            Self::Proto { .. } => RawCode::Proto,
            Self::Again => RawCode::Again,
            Self::Uninit => RawCode::Uninit,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::InProgress | Self::Busy | Self::Again)
    }

    /// Create an invalid-argument error.
    pub fn inval(detail: impl Into<String>) -> Self {
        Self::Inval {
            detail: detail.into(),
        }
    }

    /// Create an I/O error.
    pub fn io(detail: impl Into<String>) -> Self {
        Self::Io {
            detail: detail.into(),
        }
    }

    /// Create an on-media format error.
    pub fn io_inval(detail: impl Into<String>) -> Self {
        Self::IoInval {
            detail: detail.into(),
        }
    }

    /// Create a protocol error.
    pub fn proto(detail: impl Into<String>) -> Self {
        Self::Proto {
            detail: detail.into(),
        }
    }
}

impl From<std::io::Error> for VosError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            detail: err.to_string(),
        }
    }
}

/// Result type alias using `VosError`.
pub type Result<T> = std::result::Result<T, VosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VosError::Overflow { required: 8192 };
        assert_eq!(err.to_string(), "buffer too small: 8192 bytes required");

        let err = VosError::inval("zero-length key");
        assert_eq!(err.to_string(), "invalid argument: zero-length key");
    }

    #[test]
    fn raw_code_values_are_stable() {
        assert_eq!(RawCode::NoPerm as i32, 1001);
        assert_eq!(RawCode::NoHandle as i32, 1002);
        assert_eq!(RawCode::Inval as i32, 1003);
        assert_eq!(RawCode::Overflow as i32, 1004);
        assert_eq!(RawCode::NonExist as i32, 1005);
        assert_eq!(RawCode::Exist as i32, 1006);
        assert_eq!(RawCode::NoSpace as i32, 1007);
        assert_eq!(RawCode::InProgress as i32, 1013);
        assert_eq!(RawCode::Io as i32, 1014);
        assert_eq!(RawCode::Uninit as i32, 1018);
    }

    #[test]
    fn raw_code_mapping() {
        assert_eq!(VosError::NonExist.raw_code(), RawCode::NonExist);
        assert_eq!(
            VosError::Overflow { required: 1 }.raw_code(),
            RawCode::Overflow
        );
        assert_eq!(VosError::inval("x").raw_code(), RawCode::Inval);
        assert_eq!(VosError::NoSpace.raw_code(), RawCode::NoSpace);
        assert_eq!(VosError::Cancelled.raw_code(), RawCode::Cancelled);
    }

    #[test]
    fn transient_classification() {
        assert!(VosError::InProgress.is_transient());
        assert!(VosError::Busy.is_transient());
        assert!(VosError::Again.is_transient());
        assert!(!VosError::NonExist.is_transient());
        assert!(!VosError::NoSpace.is_transient());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "blob missing");
        let err: VosError = io_err.into();
        assert!(matches!(err, VosError::Io { .. }));
        assert_eq!(err.raw_code(), RawCode::Io);
    }
}
