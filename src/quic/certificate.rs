//! Peer certificate validation
//!
//! Chain building and revocation checking are delegated to a
//! [`ChainValidator`]; this module only applies the policy: which errors are
//! fatal, when the user callback runs, and which status goes back to the
//! engine when the certificate is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::native::{Certificate, Status};

/// Problems found while validating the peer certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyErrors {
    pub certificate_not_available: bool,
    pub name_mismatch: bool,
    pub chain_errors: bool,
}

impl PolicyErrors {
    pub const NONE: Self = Self {
        certificate_not_available: false,
        name_mismatch: false,
        chain_errors: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationMode {
    NoCheck,
    #[default]
    Online,
    Offline,
}

/// Builds and checks the peer's chain.
pub trait ChainValidator: Send + Sync {
    fn validate(
        &self,
        certificate: &Certificate,
        chain: &[Certificate],
        target_host: Option<&str>,
        revocation_mode: RevocationMode,
    ) -> PolicyErrors;
}

/// Information about the connection handed to the validation callback.
#[derive(Debug, Clone)]
pub struct CertificateContext {
    pub target_host: Option<String>,
    pub remote_address: Option<SocketAddr>,
    pub is_server: bool,
}

pub type ValidationCallback =
    Arc<dyn Fn(&CertificateContext, Option<&Certificate>, &[Certificate], PolicyErrors) -> bool + Send + Sync>;

/// Validation policy for one side of a connection.
#[derive(Clone, Default)]
pub struct CertificateValidation {
    pub callback: Option<ValidationCallback>,
    pub validator: Option<Arc<dyn ChainValidator>>,
    pub revocation_mode: RevocationMode,
}

impl fmt::Debug for CertificateValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateValidation")
            .field("callback", &self.callback.is_some())
            .field("validator", &self.validator.is_some())
            .field("revocation_mode", &self.revocation_mode)
            .finish()
    }
}

/// Decides what to tell the engine about the peer certificate.
///
/// `cached` holds the callback's verdict from an earlier delivery on the same
/// connection; the callback runs at most once per connection.
pub(crate) fn evaluate(
    validation: &CertificateValidation,
    context: &CertificateContext,
    certificate: Option<&Certificate>,
    chain: &[Certificate],
    deferred_status: Status,
    certificate_required: bool,
    cached: &mut Option<bool>,
) -> Status {
    let errors = match certificate {
        None if !certificate_required => return Status::Success,
        None => PolicyErrors {
            certificate_not_available: true,
            ..PolicyErrors::NONE
        },
        Some(certificate) => match &validation.validator {
            Some(validator) => validator.validate(
                certificate,
                chain,
                context.target_host.as_deref(),
                validation.revocation_mode,
            ),
            None => PolicyErrors {
                chain_errors: deferred_status.is_failure(),
                ..PolicyErrors::NONE
            },
        },
    };

    let accepted = match &validation.callback {
        Some(callback) => *cached.get_or_insert_with(|| callback(context, certificate, chain, errors)),
        None => errors.is_empty(),
    };

    if accepted {
        Status::Success
    } else if certificate.is_none() {
        Status::CertNoCert
    } else {
        Status::BadCertificate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NameMismatch;

    impl ChainValidator for NameMismatch {
        fn validate(&self, _: &Certificate, _: &[Certificate], _: Option<&str>, _: RevocationMode) -> PolicyErrors {
            PolicyErrors {
                name_mismatch: true,
                ..PolicyErrors::NONE
            }
        }
    }

    fn context() -> CertificateContext {
        CertificateContext {
            target_host: Some("example.test".into()),
            remote_address: None,
            is_server: false,
        }
    }

    fn certificate() -> Certificate {
        Certificate(Bytes::from_static(b"\x30\x82fake-der"))
    }

    #[test]
    fn test_missing_certificate_uses_distinct_status() {
        let mut cached = None;
        let status = evaluate(
            &CertificateValidation::default(),
            &context(),
            None,
            &[],
            Status::Success,
            true,
            &mut cached,
        );
        assert_eq!(status, Status::CertNoCert);
    }

    #[test]
    fn test_optional_client_certificate_is_accepted() {
        let mut cached = None;
        let status = evaluate(
            &CertificateValidation::default(),
            &context(),
            None,
            &[],
            Status::Success,
            false,
            &mut cached,
        );
        assert_eq!(status, Status::Success);
    }

    #[test]
    fn test_chain_errors_reject_without_callback() {
        let validation = CertificateValidation {
            validator: Some(Arc::new(NameMismatch)),
            ..CertificateValidation::default()
        };
        let mut cached = None;
        let status = evaluate(&validation, &context(), Some(&certificate()), &[], Status::Success, true, &mut cached);
        assert_eq!(status, Status::BadCertificate);
    }

    #[test]
    fn test_callback_verdict_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let validation = CertificateValidation {
            callback: Some(Arc::new(move |_, _, _, errors: PolicyErrors| {
                seen.fetch_add(1, Ordering::SeqCst);
                errors.name_mismatch
            })),
            validator: Some(Arc::new(NameMismatch)),
            revocation_mode: RevocationMode::NoCheck,
        };
        let mut cached = None;
        for _ in 0..3 {
            let status = evaluate(&validation, &context(), Some(&certificate()), &[], Status::Success, true, &mut cached);
            assert_eq!(status, Status::Success);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached, Some(true));
    }
}
