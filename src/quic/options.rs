//! Client, server and listener options

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QuicError, Result};
use crate::native::{Certificate, CredentialConfig, NativeSettings, NewConnectionInfo};

use super::certificate::CertificateValidation;

/// Default application error code for aborts the application did not
/// choose a code for.
pub const DEFAULT_ERROR_CODE: u64 = 0;

/// Where an outbound connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEndpoint {
    Ip(SocketAddr),
    Dns { host: String, port: u16 },
}

impl RemoteEndpoint {
    pub fn port(&self) -> u16 {
        match self {
            RemoteEndpoint::Ip(address) => address.port(),
            RemoteEndpoint::Dns { port, .. } => *port,
        }
    }
}

impl From<SocketAddr> for RemoteEndpoint {
    fn from(address: SocketAddr) -> Self {
        RemoteEndpoint::Ip(address)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteEndpoint::Ip(address) => write!(f, "{}", address),
            RemoteEndpoint::Dns { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Settings shared by both ends of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionDefaults {
    pub idle_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub keep_alive_interval: Option<Duration>,
    pub max_inbound_bidirectional_streams: u16,
    pub max_inbound_unidirectional_streams: u16,
    /// Used when a stream is aborted without an explicit code.
    pub default_stream_error_code: u64,
    /// Used when the connection is closed without an explicit code.
    pub default_close_error_code: u64,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Some(Duration::from_secs(10)),
            keep_alive_interval: None,
            max_inbound_bidirectional_streams: 100,
            max_inbound_unidirectional_streams: 10,
            default_stream_error_code: DEFAULT_ERROR_CODE,
            default_close_error_code: DEFAULT_ERROR_CODE,
        }
    }
}

impl ConnectionDefaults {
    pub(crate) fn native_settings(&self) -> NativeSettings {
        NativeSettings {
            idle_timeout: self.idle_timeout,
            handshake_idle_timeout: self.handshake_timeout,
            keep_alive_interval: self.keep_alive_interval,
            peer_bidirectional_stream_count: self.max_inbound_bidirectional_streams,
            peer_unidirectional_stream_count: self.max_inbound_unidirectional_streams,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConnectionOptions {
    pub remote_endpoint: RemoteEndpoint,
    /// SNI and certificate name; falls back to the DNS host, then the IP.
    pub target_host: Option<String>,
    pub application_protocols: Vec<Vec<u8>>,
    pub client_certificate_chain: Vec<Certificate>,
    pub client_private_key: Option<Bytes>,
    pub validation: CertificateValidation,
    pub defaults: ConnectionDefaults,
}

impl ClientConnectionOptions {
    pub fn new(remote_endpoint: impl Into<RemoteEndpoint>, application_protocols: Vec<Vec<u8>>) -> Self {
        Self {
            remote_endpoint: remote_endpoint.into(),
            target_host: None,
            application_protocols,
            client_certificate_chain: Vec::new(),
            client_private_key: None,
            validation: CertificateValidation::default(),
            defaults: ConnectionDefaults::default(),
        }
    }

    pub fn with_target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = Some(host.into());
        self
    }

    pub fn with_validation(mut self, validation: CertificateValidation) -> Self {
        self.validation = validation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_alpn(&self.application_protocols)?;
        if self.remote_endpoint.port() == 0 {
            return Err(QuicError::Config("remote endpoint port must be non-zero".into()));
        }
        if let RemoteEndpoint::Dns { host, .. } = &self.remote_endpoint {
            if host.is_empty() {
                return Err(QuicError::Config("remote host name is empty".into()));
            }
        }
        Ok(())
    }

    /// Server name and port handed to the engine's start call.
    pub(crate) fn server_name(&self) -> (String, u16) {
        let port = self.remote_endpoint.port();
        if let Some(host) = self.target_host.as_ref().filter(|host| !host.is_empty()) {
            return (host.clone(), port);
        }
        match &self.remote_endpoint {
            RemoteEndpoint::Dns { host, .. } => (host.clone(), port),
            RemoteEndpoint::Ip(address) => (address.ip().to_string(), port),
        }
    }

    pub(crate) fn credentials(&self) -> CredentialConfig {
        CredentialConfig {
            client: true,
            certificate_chain: self.client_certificate_chain.clone(),
            private_key: self.client_private_key.clone(),
            require_client_certificate: false,
            indicate_certificate_received: true,
            defer_certificate_validation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConnectionOptions {
    pub application_protocols: Vec<Vec<u8>>,
    pub certificate_chain: Vec<Certificate>,
    pub private_key: Option<Bytes>,
    pub client_certificate_required: bool,
    pub validation: CertificateValidation,
    pub defaults: ConnectionDefaults,
}

impl ServerConnectionOptions {
    pub fn new(application_protocols: Vec<Vec<u8>>, certificate_chain: Vec<Certificate>, private_key: Bytes) -> Self {
        Self {
            application_protocols,
            certificate_chain,
            private_key: Some(private_key),
            client_certificate_required: false,
            validation: CertificateValidation::default(),
            defaults: ConnectionDefaults::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_alpn(&self.application_protocols)?;
        if self.certificate_chain.is_empty() {
            return Err(QuicError::Config("server certificate chain is empty".into()));
        }
        Ok(())
    }

    pub(crate) fn credentials(&self) -> CredentialConfig {
        CredentialConfig {
            client: false,
            certificate_chain: self.certificate_chain.clone(),
            private_key: self.private_key.clone(),
            require_client_certificate: self.client_certificate_required,
            indicate_certificate_received: true,
            defer_certificate_validation: true,
        }
    }
}

/// Picks server options per incoming client hello.
#[async_trait]
pub trait ServerOptionsProvider: Send + Sync {
    async fn options_for(&self, hello: &NewConnectionInfo) -> Result<ServerConnectionOptions>;
}

#[derive(Clone)]
pub enum ServerOptionsSource {
    Fixed(ServerConnectionOptions),
    Provider(Arc<dyn ServerOptionsProvider>),
}

impl fmt::Debug for ServerOptionsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerOptionsSource::Fixed(options) => f.debug_tuple("Fixed").field(options).finish(),
            ServerOptionsSource::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub listen_endpoint: SocketAddr,
    pub application_protocols: Vec<Vec<u8>>,
    /// Handshake-complete connections waiting for `accept_connection`.
    pub listen_backlog: usize,
    pub server_options: ServerOptionsSource,
}

impl ListenerOptions {
    pub fn new(
        listen_endpoint: SocketAddr,
        application_protocols: Vec<Vec<u8>>,
        server_options: ServerOptionsSource,
    ) -> Self {
        Self {
            listen_endpoint,
            application_protocols,
            listen_backlog: 512,
            server_options,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_alpn(&self.application_protocols)?;
        if self.listen_backlog == 0 {
            return Err(QuicError::Config("listen backlog must be positive".into()));
        }
        if let ServerOptionsSource::Fixed(options) = &self.server_options {
            options.validate()?;
        }
        Ok(())
    }
}

fn validate_alpn(protocols: &[Vec<u8>]) -> Result<()> {
    if protocols.is_empty() {
        return Err(QuicError::Config("at least one application protocol is required".into()));
    }
    if let Some(protocol) = protocols.iter().find(|p| p.is_empty() || p.len() > 255) {
        return Err(QuicError::Config(format!(
            "application protocol must be 1..=255 bytes, got {}",
            protocol.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_resolution_order() {
        let ip: SocketAddr = "192.0.2.7:4433".parse().unwrap();
        let options = ClientConnectionOptions::new(ip, vec![b"h3".to_vec()]);
        assert_eq!(options.server_name(), ("192.0.2.7".to_string(), 4433));

        let options = ClientConnectionOptions::new(
            RemoteEndpoint::Dns {
                host: "quic.example".into(),
                port: 443,
            },
            vec![b"h3".to_vec()],
        );
        assert_eq!(options.server_name(), ("quic.example".to_string(), 443));

        let options = options.with_target_host("sni.example");
        assert_eq!(options.server_name(), ("sni.example".to_string(), 443));
    }

    #[test]
    fn test_alpn_validation() {
        let ip: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        assert!(ClientConnectionOptions::new(ip, vec![]).validate().is_err());
        assert!(ClientConnectionOptions::new(ip, vec![vec![]]).validate().is_err());
        assert!(ClientConnectionOptions::new(ip, vec![b"h3".to_vec()]).validate().is_ok());
    }
}
