//! QUIC connection and stream lifecycle over the native engine
//!
//! Public objects ([`Connection`], [`Stream`], [`Listener`]) own shared
//! state records that the engine reaches through the registry by context
//! token. Event handlers mutate those records under a short lock and
//! resolve completions after releasing it.

pub mod certificate;
pub(crate) mod completion;
pub mod connection;
pub(crate) mod dispatch;
pub mod listener;
pub mod options;
pub(crate) mod registry;
pub mod stream;

pub use certificate::{
    CertificateContext, CertificateValidation, ChainValidator, PolicyErrors, RevocationMode, ValidationCallback,
};
pub use connection::{Connection, ConnectionPhase};
pub use listener::Listener;
pub use options::{
    ClientConnectionOptions, ConnectionDefaults, ListenerOptions, RemoteEndpoint, ServerConnectionOptions,
    ServerOptionsProvider, ServerOptionsSource, DEFAULT_ERROR_CODE,
};
pub use stream::{Stream, StreamDirection, StreamKind};
