use crate::value::Value;

use thiserror;

use std;
use std::str::Utf8Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in this crate.
///
/// `Error` is `Clone` so that a single connection failure can be handed
/// to every caller that was waiting on the connection when it broke.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("malformed signature {signature:?}: {reason}")]
    MalformedSignature { signature: String, reason: String },
    #[error("body does not match signature {signature:?}: {reason}")]
    BodyShapeMismatch { signature: String, reason: String },
    #[error("connection broken: {0}")]
    ConnectionBroken(String),
    #[error("not connected")]
    NotConnected,
    #[error("bus is already connected")]
    AlreadyConnected,
    /// An error reply. `body` is the reply's whole body, `text` its leading
    /// string if it has one.
    #[error("method call failed with {name}: {text}")]
    MethodError {
        name: String,
        text: String,
        body: Vec<Value>,
    },
    #[error("no reply to call with serial {0} before the timeout")]
    Timeout(u32),
    #[error("body carries unix fds but fd passing was not negotiated")]
    UnixFdNotNegotiated,
    #[error("body truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("{0} bytes of leftover data after body")]
    LeftoverData(usize),
    #[error("invalid boolean value {0}")]
    InvalidBoolValue(u32),
    #[error("malformed string at offset {offset}: {reason}")]
    MalformedString { offset: usize, reason: String },
    #[error("invalid utf-8 in string: {0}")]
    InvalidUtf8(String),
    #[error("array ended at {actual}, length field said {expected}")]
    ArrayLengthMismatch { expected: usize, actual: usize },
}

impl Error {
    pub(crate) fn malformed(signature: &str, reason: impl Into<String>) -> Self {
        Error::MalformedSignature {
            signature: signature.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(signature: &str, reason: impl Into<String>) -> Self {
        Error::BodyShapeMismatch {
            signature: signature.to_owned(),
            reason: reason.into(),
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Error::InvalidUtf8(err.to_string())
    }
}
