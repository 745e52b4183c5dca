//! Indirection tables between engine context tokens and shared state
//!
//! The engine only ever sees a `Context` integer. Each table holds the strong
//! reference that keeps a state alive for the callback side; removing the
//! entry is what lets the state drop once the application side lets go too.

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::native::Context;

use super::connection::ConnectionState;
use super::listener::ListenerState;
use super::stream::StreamState;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Registry<T> {
    entries: DashMap<Context, Arc<T>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Reserves a token before the state that will own it exists.
    pub(crate) fn allocate(&self) -> Context {
        NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, context: Context, state: Arc<T>) {
        self.entries.insert(context, state);
    }

    pub(crate) fn get(&self, context: Context) -> Option<Arc<T>> {
        self.entries.get(&context).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, context: Context) -> Option<Arc<T>> {
        self.entries.remove(&context).map(|(_, state)| state)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, context: Context) -> bool {
        self.entries.contains_key(&context)
    }
}

lazy_static! {
    pub(crate) static ref CONNECTIONS: Registry<ConnectionState> = Registry::new();
    pub(crate) static ref STREAMS: Registry<StreamState> = Registry::new();
    pub(crate) static ref LISTENERS: Registry<ListenerState> = Registry::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_resolvable() {
        let registry: Registry<String> = Registry::new();
        let first = registry.allocate();
        let second = registry.allocate();
        assert_ne!(first, second);

        registry.insert(first, Arc::new("state".to_string()));
        assert_eq!(registry.get(first).as_deref().map(String::as_str), Some("state"));
        assert!(registry.get(second).is_none());

        assert!(registry.remove(first).is_some());
        assert!(!registry.contains(first));
    }
}
