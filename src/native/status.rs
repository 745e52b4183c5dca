//! Native engine status codes
//!
//! The engine reports every call and callback outcome as a status code where
//! zero means success. Only the categories the orchestration layer reacts to
//! get their own variant; everything else is carried verbatim in
//! [`Status::Other`] for diagnostics.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    /// The operation will complete later through an event.
    Pending,
    Continue,
    Aborted,
    InvalidState,
    InvalidParameter,
    /// The handle was already closed by the engine.
    HandleClosed,
    AlreadyConnected,
    ConnectionRefused,
    ConnectionTimeout,
    ConnectionIdle,
    Unreachable,
    AddressInUse,
    AlpnInUse,
    /// Peer certificate failed chain or name validation.
    BadCertificate,
    /// Peer certificate was required but none was presented.
    CertNoCert,
    TlsError,
    InternalError,
    OutOfMemory,
    NotSupported,
    Other(u32),
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::Pending | Status::Continue)
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }

    /// Converts a call status into a `Result`, treating `Pending` as success.
    pub fn ok(self) -> Result<(), Status> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }

    /// Numeric code, for logs and for engines that speak raw integers.
    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0,
            Status::Pending => 0x0007_03E5,
            Status::Continue => 0x0007_04DE,
            Status::Aborted => 0x8000_4004,
            Status::InvalidState => 0x8007_139F,
            Status::InvalidParameter => 0x8007_0057,
            Status::HandleClosed => 0x8007_0006,
            Status::AlreadyConnected => 0x8007_2748,
            Status::ConnectionRefused => 0x8007_04C9,
            Status::ConnectionTimeout => 0x8007_05B4,
            Status::ConnectionIdle => 0x8007_04D4,
            Status::Unreachable => 0x8007_04D0,
            Status::AddressInUse => 0x8007_2740,
            Status::AlpnInUse => 0x8007_2741,
            Status::BadCertificate => 0x8009_0326,
            Status::CertNoCert => 0x8009_0327,
            Status::TlsError => 0x8007_6990,
            Status::InternalError => 0x8007_13A1,
            Status::OutOfMemory => 0x8007_000E,
            Status::NotSupported => 0x8007_0032,
            Status::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        const KNOWN: [Status; 20] = [
            Status::Success,
            Status::Pending,
            Status::Continue,
            Status::Aborted,
            Status::InvalidState,
            Status::InvalidParameter,
            Status::HandleClosed,
            Status::AlreadyConnected,
            Status::ConnectionRefused,
            Status::ConnectionTimeout,
            Status::ConnectionIdle,
            Status::Unreachable,
            Status::AddressInUse,
            Status::AlpnInUse,
            Status::BadCertificate,
            Status::CertNoCert,
            Status::TlsError,
            Status::InternalError,
            Status::OutOfMemory,
            Status::NotSupported,
        ];
        KNOWN
            .into_iter()
            .find(|status| status.code() == code)
            .unwrap_or(Status::Other(code))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Other(code) => write!(f, "status 0x{code:08x}"),
            known => write!(f, "{known:?} (0x{:08x})", known.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_is_not_failure() {
        assert!(Status::Pending.is_success());
        assert!(Status::Pending.ok().is_ok());
        assert_eq!(Status::Aborted.ok(), Err(Status::Aborted));
    }

    #[test]
    fn test_code_round_trip_for_known_and_unknown() {
        assert_eq!(Status::from_code(Status::HandleClosed.code()), Status::HandleClosed);
        assert_eq!(Status::from_code(0x1234), Status::Other(0x1234));
    }
}
