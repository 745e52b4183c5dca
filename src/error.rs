use thiserror::Error;

use crate::native::Status;
use crate::websocket::CloseStatus;

/// QUIC connection and stream errors
///
/// Cloneable so a single failure can be delivered to every waiter of a
/// shared completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuicError {
    #[error("Connection aborted by peer with error code {0}")]
    ConnectionAborted(u64),

    #[error("Stream aborted with error code {0}")]
    StreamAborted(u64),

    #[error("Operation aborted")]
    OperationAborted,

    #[error("Operation canceled")]
    Canceled,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Connection idle")]
    ConnectionIdle,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Address in use")]
    AddressInUse,

    #[error("ALPN in use")]
    AlpnInUse,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Native engine failure: {status}")]
    Native { status: Status },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone
}

impl QuicError {
    /// Error for an abort whose code may never have been set.
    pub fn connection_aborted(code: Option<u64>) -> Self {
        match code {
            Some(code) => QuicError::ConnectionAborted(code),
            None => QuicError::OperationAborted,
        }
    }

    pub fn stream_aborted(code: Option<u64>) -> Self {
        match code {
            Some(code) => QuicError::StreamAborted(code),
            None => QuicError::OperationAborted,
        }
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        QuicError::InvalidOperation(message.into())
    }

    /// Maps a failed native status from a connection attempt to the
    /// connection-level error the caller sees.
    pub fn from_connect_status(status: Status) -> Self {
        match status {
            Status::ConnectionRefused => QuicError::ConnectionRefused,
            Status::ConnectionTimeout => QuicError::ConnectionTimeout,
            Status::ConnectionIdle => QuicError::ConnectionIdle,
            Status::Unreachable => QuicError::HostUnreachable,
            Status::AddressInUse => QuicError::AddressInUse,
            Status::AlpnInUse => QuicError::AlpnInUse,
            Status::Aborted => QuicError::OperationAborted,
            Status::BadCertificate | Status::CertNoCert | Status::TlsError => {
                QuicError::Tls(status.to_string())
            }
            other => QuicError::Native { status: other },
        }
    }

    /// Status handed back to the engine when an event handler fails with
    /// this error.
    pub fn status(&self) -> Status {
        match self {
            QuicError::Native { status } => *status,
            QuicError::ConnectionAborted(_) | QuicError::StreamAborted(_) | QuicError::OperationAborted => {
                Status::Aborted
            }
            QuicError::InvalidOperation(_) => Status::InvalidState,
            QuicError::Config(_) => Status::InvalidParameter,
            QuicError::Tls(_) => Status::TlsError,
            _ => Status::InternalError,
        }
    }

    /// Whether the error came from the peer or the engine tearing the
    /// object down, as opposed to local misuse.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            QuicError::ConnectionAborted(_)
                | QuicError::StreamAborted(_)
                | QuicError::OperationAborted
        )
    }
}

impl From<Status> for QuicError {
    fn from(status: Status) -> Self {
        QuicError::Native { status }
    }
}

impl From<std::io::Error> for QuicError {
    fn from(err: std::io::Error) -> Self {
        QuicError::Io(err.to_string())
    }
}

impl From<QuicError> for std::io::Error {
    fn from(err: QuicError) -> Self {
        let kind = match &err {
            QuicError::ConnectionAborted(_) => std::io::ErrorKind::ConnectionAborted,
            QuicError::StreamAborted(_) | QuicError::OperationAborted => {
                std::io::ErrorKind::ConnectionReset
            }
            QuicError::Canceled => std::io::ErrorKind::Interrupted,
            QuicError::ConnectionRefused => std::io::ErrorKind::ConnectionRefused,
            QuicError::ConnectionTimeout => std::io::ErrorKind::TimedOut,
            QuicError::AddressInUse => std::io::ErrorKind::AddrInUse,
            QuicError::InvalidOperation(_) => std::io::ErrorKind::Unsupported,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// WebSocket engine errors
#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("Protocol violation ({status}): {message}")]
    Protocol { status: CloseStatus, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("WebSocket aborted")]
    Aborted,

    #[error("Timed out waiting for the peer's close frame")]
    CloseTimeout,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    pub(crate) fn protocol(status: CloseStatus, message: impl Into<String>) -> Self {
        WebSocketError::Protocol {
            status,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QuicError>;
pub type WebSocketResult<T> = std::result::Result<T, WebSocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_abort_code_maps_to_operation_aborted() {
        assert_eq!(QuicError::stream_aborted(None), QuicError::OperationAborted);
        assert_eq!(QuicError::stream_aborted(Some(0)), QuicError::StreamAborted(0));
        assert_eq!(
            QuicError::connection_aborted(Some(7)),
            QuicError::ConnectionAborted(7)
        );
    }

    #[test]
    fn test_connect_status_mapping() {
        assert_eq!(
            QuicError::from_connect_status(Status::Unreachable),
            QuicError::HostUnreachable
        );
        assert_eq!(
            QuicError::from_connect_status(Status::Other(0xdead)),
            QuicError::Native {
                status: Status::Other(0xdead)
            }
        );
        assert!(matches!(
            QuicError::from_connect_status(Status::BadCertificate),
            QuicError::Tls(_)
        ));
    }

    #[test]
    fn test_engine_status_for_handler_errors() {
        assert_eq!(QuicError::from(Status::AlpnInUse).status(), Status::AlpnInUse);
        assert_eq!(QuicError::Config("bad".into()).status(), Status::InvalidParameter);
        assert_eq!(QuicError::Canceled.status(), Status::InternalError);
    }

    #[test]
    fn test_abort_classification() {
        assert!(QuicError::connection_aborted(None).is_abort());
        assert!(QuicError::StreamAborted(1).is_abort());
        assert!(!QuicError::Tls("bad certificate".into()).is_abort());
    }

    #[test]
    fn test_io_error_kinds() {
        let err: std::io::Error = QuicError::ConnectionRefused.into();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
        let err: std::io::Error = QuicError::StreamAborted(3).into();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
