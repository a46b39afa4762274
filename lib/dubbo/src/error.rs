use hessian2::DecodeError;
use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;

/// Status codes carried in byte 3 of a response header.
pub const STATUS_OK: u8 = 20;

/// Maps a response status code to its protocol name.
pub fn status_text(status: u8) -> &'static str {
    match status {
        20 => "OK",
        30 => "CLIENT_TIMEOUT",
        31 => "SERVER_TIMEOUT",
        40 => "BAD_REQUEST",
        50 => "BAD_RESPONSE",
        60 => "SERVICE_NOT_FOUND",
        70 => "SERVICE_ERROR",
        80 => "SERVER_ERROR",
        90 => "CLIENT_ERROR",
        _ => "UNKNOWN",
    }
}

/// Every way a call can fail, exactly one of which is reported per call.
#[derive(Debug)]
pub enum DubboError {
    /// Malformed frame or broken connection state. Fatal to the connection
    /// that produced it; the pool reconnects on the next call.
    Protocol(String),
    /// The response header carried a status other than OK. The connection
    /// remains usable.
    RemoteResponse { status: u8, message: String },
    /// The provider returned an exception payload (response flag 0).
    RemoteApplication(String),
    /// A value could not be mapped onto the wire, or a payload byte was
    /// inconsistent with its context.
    Hessian(String),
    /// No response arrived within the caller's deadline. Any response that
    /// shows up later is discarded.
    RequestTimeout { host: String, timeout: Duration },
    /// Provider discovery failed before any I/O was attempted.
    Registry(String),
}

impl fmt::Display for DubboError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DubboError::Protocol(message) => write!(f, "protocol error: {}", message),
            DubboError::RemoteResponse { status, message } => write!(
                f,
                "remote response error: status {} ({}): {}",
                status,
                status_text(*status),
                message
            ),
            DubboError::RemoteApplication(message) => {
                write!(f, "remote application error: {}", message)
            }
            DubboError::Hessian(message) => write!(f, "hessian type error: {}", message),
            DubboError::RequestTimeout { host, timeout } => write!(
                f,
                "request timeout: no response from {} within {:?}",
                host, timeout
            ),
            DubboError::Registry(message) => write!(f, "registry error: {}", message),
        }
    }
}

impl Error for DubboError {}

impl From<DecodeError> for DubboError {
    fn from(error: DecodeError) -> DubboError {
        DubboError::Hessian(error.to_string())
    }
}

pub type DubboResult<T> = Result<T, DubboError>;

/// Connection-layer result plumbing: `Wait` means the socket has no more to
/// give right now, `Fatal` means the connection is done for.
#[derive(Debug)]
pub(crate) enum NetError {
    Wait,
    Fatal(FatalKind),
}

#[derive(Debug)]
pub(crate) enum FatalKind {
    /// Remote closed the stream.
    Closed,
    /// Bad magic, impossible length, or a header that cannot be parsed.
    Protocol(String),
    Io(io::Error),
}

impl From<io::Error> for NetError {
    fn from(error: io::Error) -> NetError {
        match error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            _ => NetError::Fatal(FatalKind::Io(error)),
        }
    }
}

impl NetError {
    pub(crate) fn protocol<S: Into<String>>(message: S) -> NetError {
        NetError::Fatal(FatalKind::Protocol(message.into()))
    }
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FatalKind::Closed => write!(f, "connection closed by remote"),
            FatalKind::Protocol(message) => write!(f, "{}", message),
            FatalKind::Io(error) => write!(f, "{}", error),
        }
    }
}

impl From<FatalKind> for DubboError {
    fn from(kind: FatalKind) -> DubboError {
        DubboError::Protocol(kind.to_string())
    }
}
