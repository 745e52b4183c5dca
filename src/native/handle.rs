use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::api::QuicApi;
use super::event::RawHandle;
use crate::error::{QuicError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Registration,
    Configuration,
    Listener,
    Connection,
    Stream,
}

/// An engine handle that is released exactly once.
///
/// Release happens on the first call to [`NativeHandle::release`] or on drop,
/// whichever comes first.
pub struct NativeHandle {
    raw: RawHandle,
    kind: HandleKind,
    api: Arc<dyn QuicApi>,
    released: AtomicBool,
}

impl NativeHandle {
    pub fn new(api: Arc<dyn QuicApi>, raw: RawHandle, kind: HandleKind) -> Self {
        trace!("acquired {:?} handle {}", kind, raw);
        Self {
            raw,
            kind,
            api,
            released: AtomicBool::new(false),
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn api(&self) -> &Arc<dyn QuicApi> {
        &self.api
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns `true` when this call performed the release.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("releasing {:?} handle {}", self.kind, self.raw);
        match self.kind {
            HandleKind::Registration => self.api.registration_close(self.raw),
            HandleKind::Configuration => self.api.configuration_close(self.raw),
            HandleKind::Listener => self.api.listener_close(self.raw),
            HandleKind::Connection => self.api.connection_close(self.raw),
            HandleKind::Stream => self.api.stream_close(self.raw),
        }
        true
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Engine registration every listener, configuration and connection hangs
/// off. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Registration {
    handle: Arc<NativeHandle>,
}

impl Registration {
    pub fn open(api: Arc<dyn QuicApi>, app_name: &str) -> Result<Self> {
        let raw = api.registration_open(app_name).map_err(QuicError::from)?;
        debug!("opened registration {} for {}", raw, app_name);
        Ok(Self {
            handle: Arc::new(NativeHandle::new(api, raw, HandleKind::Registration)),
        })
    }

    pub fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    pub fn api(&self) -> &Arc<dyn QuicApi> {
        self.handle.api()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::recording::{Call, RecordingEngine};

    #[test]
    fn test_release_is_idempotent() {
        let engine = RecordingEngine::new();
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let handle = NativeHandle::new(engine.clone(), RawHandle(0x99), HandleKind::Stream);

        assert!(handle.release());
        assert!(!handle.release());
        drop(handle);

        assert_eq!(engine.count(|call| matches!(call, Call::StreamClose(RawHandle(0x99)))), 1);
        drop(registration);
        assert_eq!(engine.count(|call| matches!(call, Call::RegistrationClose(_))), 1);
    }
}
