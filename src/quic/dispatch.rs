//! Entry points the native engine calls back into
//!
//! Each callback resolves its context token through the registry and hands
//! the event to the owning state. Nothing escapes to the engine: handler
//! errors and panics become [`Status::InternalError`].

use std::panic::{self, AssertUnwindSafe};
use tracing::{error, trace, warn};

use crate::error::QuicError;
use crate::native::{ConnectionEvent, Context, ListenerEvent, RawHandle, Status, StreamEvent};

use super::registry::{CONNECTIONS, LISTENERS, STREAMS};

pub(crate) fn connection_callback(handle: RawHandle, context: Context, event: &mut ConnectionEvent) -> Status {
    let Some(state) = CONNECTIONS.get(context) else {
        warn!("[conn][{}] {} for unknown context {}", handle, event.name(), context);
        return Status::InvalidState;
    };
    let name = event.name();
    trace!("{} received event {}", state.trace_id(), name);

    // Failures while the handshake is still in flight must reach the caller
    // waiting in connect.
    let establishing = matches!(
        event,
        ConnectionEvent::Connected { .. }
            | ConnectionEvent::PeerCertificateReceived { .. }
            | ConnectionEvent::ShutdownInitiatedByTransport { .. }
    );

    match panic::catch_unwind(AssertUnwindSafe(|| state.handle_event(event))) {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            error!("{} exception while processing event {}: {}", state.trace_id(), name, err);
            if establishing {
                state.fail_connect(err);
            }
            Status::InternalError
        }
        Err(_) => {
            error!("{} panic while processing event {}", state.trace_id(), name);
            if establishing {
                state.fail_connect(QuicError::Native {
                    status: Status::InternalError,
                });
            }
            Status::InternalError
        }
    }
}

pub(crate) fn stream_callback(handle: RawHandle, context: Context, event: &mut StreamEvent) -> Status {
    let Some(state) = STREAMS.get(context) else {
        warn!("[strm][{}] {} for unknown context {}", handle, event.name(), context);
        return Status::InvalidState;
    };
    let name = event.name();
    trace!("{} received event {}", state.trace_id(), name);

    match panic::catch_unwind(AssertUnwindSafe(|| state.handle_event(event))) {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            error!("{} exception while processing event {}: {}", state.trace_id(), name, err);
            Status::InternalError
        }
        Err(_) => {
            error!("{} panic while processing event {}", state.trace_id(), name);
            Status::InternalError
        }
    }
}

pub(crate) fn listener_callback(handle: RawHandle, context: Context, event: &mut ListenerEvent) -> Status {
    let Some(state) = LISTENERS.get(context) else {
        warn!("[list][{}] {} for unknown context {}", handle, event.name(), context);
        return Status::InvalidState;
    };
    let name = event.name();
    trace!("{} received event {}", state.trace_id(), name);

    match panic::catch_unwind(AssertUnwindSafe(|| state.handle_event(event))) {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            error!("{} exception while processing event {}: {}", state.trace_id(), name, err);
            Status::InternalError
        }
        Err(_) => {
            error!("{} panic while processing event {}", state.trace_id(), name);
            Status::InternalError
        }
    }
}
