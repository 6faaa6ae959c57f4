//! Handler registry — maps hub method names to client-side handlers.
//!
//! Handlers are registered while the connection is disconnected and stay
//! registered for the life of the connection. The hub dispatches each
//! server invocation to the handler for its target; a missing handler is
//! logged and otherwise ignored.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};

/// A client-side handler for a server-invoked hub method.
///
/// Handlers receive the invocation's ordered argument list. They run on a
/// short-lived dispatch task, so a slow handler delays only itself.
pub type MethodHandler = Arc<dyn Fn(&[Value]) + Send + Sync + 'static>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, MethodHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method_name`.
    ///
    /// Fails with a logic error on an empty name or a duplicate
    /// registration; in both cases the registry is left unchanged. The
    /// connection-state gate (register only while disconnected) lives at
    /// the hub connection, which owns the state.
    pub fn register(
        &self,
        method_name: &str,
        handler: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> Result<()> {
        if method_name.is_empty() {
            return Err(Error::Logic("method name cannot be empty".into()));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(method_name) {
            return Err(Error::Logic(format!(
                "a handler for this method has already been registered: {method_name}"
            )));
        }
        handlers.insert(method_name.to_owned(), Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, method_name: &str) -> Option<MethodHandler> {
        self.handlers.read().get(method_name).cloned()
    }

    /// Dispatch an invocation to its handler.
    ///
    /// A missing handler is logged at info. A panicking handler is caught
    /// and logged; it never tears down the connection.
    pub fn dispatch(&self, target: &str, arguments: &[Value]) {
        match self.get(target) {
            Some(handler) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| handler(arguments))).is_err() {
                    tracing::warn!(target = %target, "invocation handler panicked");
                }
            }
            None => {
                tracing::info!(target = %target, "no handler registered for invocation");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
