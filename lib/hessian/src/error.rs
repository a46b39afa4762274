use std::error::Error;
use std::fmt;

/// An error produced while decoding a Hessian byte stream: an opcode that is
/// inconsistent with the requested type, a truncated buffer, or malformed
/// UTF-8 payload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    description: String,
}

impl DecodeError {
    pub fn new<S: Into<String>>(description: S) -> DecodeError {
        DecodeError {
            description: description.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to decode hessian value: {}", self.description)
    }
}

impl Error for DecodeError {}
