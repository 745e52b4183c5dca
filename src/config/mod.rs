//! Configuration management for connections, listeners and WebSockets
//!
//! Values are layered: built-in defaults, then an optional file, then
//! `GSOCK_*` environment variables (`GSOCK_CONNECTION__IDLE_TIMEOUT_MS=5000`).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{QuicError, Result};
use crate::native::Certificate;
use crate::quic::{
    CertificateValidation, ClientConnectionOptions, ConnectionDefaults, ListenerOptions, RemoteEndpoint,
    RevocationMode, ServerConnectionOptions, ServerOptionsSource,
};
use crate::websocket::{DeflateOptions, Role, WebSocketOptions};

const ENV_PREFIX: &str = "GSOCK";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GsockConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Listener configuration
    pub listener: ListenerConfig,
    /// WebSocket configuration
    pub websocket: WebSocketConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// ALPN identifiers offered or accepted
    pub application_protocols: Vec<String>,
    /// Idle timeout in milliseconds, 0 leaves the engine default
    pub idle_timeout_ms: u64,
    /// Handshake timeout in milliseconds, 0 leaves the engine default
    pub handshake_timeout_ms: u64,
    /// Keep-alive interval in milliseconds, 0 disables
    pub keep_alive_interval_ms: u64,
    /// Bidirectional streams the peer may open
    pub max_inbound_bidirectional_streams: u16,
    /// Unidirectional streams the peer may open
    pub max_inbound_unidirectional_streams: u16,
    /// Error code for stream aborts without an explicit code
    pub default_stream_error_code: u64,
    /// Error code for connection closes without an explicit code
    pub default_close_error_code: u64,
    /// Certificate revocation checking
    pub revocation_mode: RevocationMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let defaults = ConnectionDefaults::default();
        Self {
            application_protocols: vec!["h3".to_string()],
            idle_timeout_ms: 30_000,     // 30 seconds
            handshake_timeout_ms: 10_000, // 10 seconds
            keep_alive_interval_ms: 0,
            max_inbound_bidirectional_streams: defaults.max_inbound_bidirectional_streams,
            max_inbound_unidirectional_streams: defaults.max_inbound_unidirectional_streams,
            default_stream_error_code: defaults.default_stream_error_code,
            default_close_error_code: defaults.default_close_error_code,
            revocation_mode: RevocationMode::default(),
        }
    }
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

impl ConnectionConfig {
    pub fn defaults(&self) -> ConnectionDefaults {
        ConnectionDefaults {
            idle_timeout: millis(self.idle_timeout_ms),
            handshake_timeout: millis(self.handshake_timeout_ms),
            keep_alive_interval: millis(self.keep_alive_interval_ms),
            max_inbound_bidirectional_streams: self.max_inbound_bidirectional_streams,
            max_inbound_unidirectional_streams: self.max_inbound_unidirectional_streams,
            default_stream_error_code: self.default_stream_error_code,
            default_close_error_code: self.default_close_error_code,
        }
    }

    pub fn alpn(&self) -> Vec<Vec<u8>> {
        self.application_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect()
    }

    fn validation(&self) -> CertificateValidation {
        CertificateValidation {
            revocation_mode: self.revocation_mode,
            ..Default::default()
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address
    pub listen_address: SocketAddr,
    /// Handshaken connections held until accepted
    pub listen_backlog: usize,
    /// Require and validate a client certificate
    pub client_certificate_required: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 4433)),
            listen_backlog: 512,
            client_certificate_required: false,
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Negotiated sub-protocol reported to the application
    pub sub_protocol: Option<String>,
    /// Unsolicited Pong interval in milliseconds, 0 disables
    pub keep_alive_interval_ms: u64,
    /// Wait for the peer's Close frame in milliseconds
    pub close_timeout_ms: u64,
    /// permessage-deflate parameters, absent when not negotiated
    pub deflate: Option<DeflateOptions>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            sub_protocol: None,
            keep_alive_interval_ms: 30_000, // 30 seconds
            close_timeout_ms: 1_000,
            deflate: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn or error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn config_error(err: config::ConfigError) -> QuicError {
    QuicError::Config(err.to_string())
}

impl GsockConfig {
    /// Loads defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = path.map(|path| config::File::with_name(path).required(true));
        Self::layered(file)
    }

    /// Like [`GsockConfig::load`] with TOML text in place of a file.
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::layered(Some(config::File::from_str(text, config::FileFormat::Toml)))
    }

    fn layered<S>(file: Option<S>) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = config::Config::try_from(&GsockConfig::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config: GsockConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let protocols = &self.connection.application_protocols;
        if protocols.is_empty() {
            return Err(QuicError::Config("connection.application_protocols is empty".into()));
        }
        if let Some(protocol) = protocols.iter().find(|p| p.is_empty() || p.len() > 255) {
            return Err(QuicError::Config(format!(
                "application protocol '{}' must be 1..=255 bytes",
                protocol
            )));
        }
        if self.listener.listen_backlog == 0 {
            return Err(QuicError::Config("listener.listen_backlog must be positive".into()));
        }
        if self.websocket.close_timeout_ms == 0 {
            return Err(QuicError::Config("websocket.close_timeout_ms must be positive".into()));
        }
        if let Some(deflate) = &self.websocket.deflate {
            deflate
                .validate()
                .map_err(|err| QuicError::Config(format!("websocket.deflate: {}", err)))?;
        }
        Ok(())
    }

    pub fn client_options(&self, remote: impl Into<RemoteEndpoint>) -> ClientConnectionOptions {
        let mut options = ClientConnectionOptions::new(remote, self.connection.alpn())
            .with_validation(self.connection.validation());
        options.defaults = self.connection.defaults();
        options
    }

    pub fn server_options(&self, certificate_chain: Vec<Certificate>, private_key: Bytes) -> ServerConnectionOptions {
        let mut options = ServerConnectionOptions::new(self.connection.alpn(), certificate_chain, private_key);
        options.client_certificate_required = self.listener.client_certificate_required;
        options.validation = self.connection.validation();
        options.defaults = self.connection.defaults();
        options
    }

    pub fn listener_options(&self, server_options: ServerOptionsSource) -> ListenerOptions {
        let mut options = ListenerOptions::new(self.listener.listen_address, self.connection.alpn(), server_options);
        options.listen_backlog = self.listener.listen_backlog;
        options
    }

    pub fn websocket_options(&self, role: Role) -> WebSocketOptions {
        WebSocketOptions {
            role,
            sub_protocol: self.websocket.sub_protocol.clone(),
            keep_alive_interval: millis(self.websocket.keep_alive_interval_ms),
            close_timeout: Duration::from_millis(self.websocket.close_timeout_ms),
            deflate: self.websocket.deflate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GsockConfig::default();
        assert!(config.validate().is_ok());
        let defaults = config.connection.defaults();
        assert_eq!(defaults.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(defaults.keep_alive_interval, None);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = GsockConfig::from_toml(
            r#"
            [connection]
            application_protocols = ["hq-interop"]
            default_close_error_code = 256

            [websocket]
            close_timeout_ms = 250

            [websocket.deflate]
            client_max_window_bits = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.alpn(), vec![b"hq-interop".to_vec()]);
        assert_eq!(config.connection.idle_timeout_ms, 30_000);
        let client = config.client_options(SocketAddr::from(([127, 0, 0, 1], 4433)));
        assert_eq!(client.defaults.default_close_error_code, 256);

        let ws = config.websocket_options(Role::Client);
        assert_eq!(ws.close_timeout, Duration::from_millis(250));
        let deflate = ws.deflate.unwrap();
        assert_eq!(deflate.client_max_window_bits, 10);
        assert_eq!(deflate.server_max_window_bits, 15);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(GsockConfig::from_toml("[listener]\nlisten_backlog = 0").is_err());
        assert!(GsockConfig::from_toml("[websocket.deflate]\nserver_max_window_bits = 16").is_err());
        assert!(GsockConfig::from_toml("[connection]\napplication_protocols = []").is_err());
    }
}
