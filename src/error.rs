use failure::Fail;

use crate::stream::StreamKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "unknown stream \"{}\", supported streams are: {}", name, supported)]
    UnknownStream { name: String, supported: String },

    #[fail(display = "unknown buffer side \"{}\", supported sides are: \"start\", \"end\"", _0)]
    UnknownBufferSide(String),

    #[fail(display = "unknown clock \"{}\", supported clocks are: \"local\", \"remote\"", _0)]
    UnknownClock(String),

    #[fail(display = "no listener with handle {}", _0)]
    UnknownHandle(u64),

    #[fail(display = "no stream with source id \"{}\" could be found", _0)]
    StreamNotFound(String),

    #[fail(display = "{} is not supported for the {} stream", operation, kind)]
    Unsupported {
        kind: StreamKind,
        operation: &'static str,
    },

    #[fail(display = "transport error {}: {}", code, message)]
    Transport { code: i32, message: String },

    #[fail(display = "eye tracker error {}: {}", code, message)]
    Device { code: i32, message: String },

    #[fail(display = "invalid state: {}", _0)]
    InvalidState(String),

    #[fail(display = "malformed frame: {}", _0)]
    Decode(String),

    #[fail(display = "{}: expected a {} buffer, found a {} buffer", owner, expected, actual)]
    TypeMismatch {
        owner: String,
        expected: StreamKind,
        actual: StreamKind,
    },
}

impl Error {
    pub(crate) fn unsupported(kind: StreamKind, operation: &'static str) -> Error {
        Error::Unsupported { kind, operation }
    }

    /// Typed access to a buffer of the wrong shape is a bug in the caller.
    /// Debug builds abort here, release builds hand the error back.
    pub(crate) fn type_mismatch(owner: &str, expected: StreamKind, actual: StreamKind) -> Error {
        debug_assert!(
            false,
            "{}: typed buffer access mismatch: expected {}, found {}",
            owner, expected, actual
        );
        Error::TypeMismatch {
            owner: owner.to_string(),
            expected,
            actual,
        }
    }
}
