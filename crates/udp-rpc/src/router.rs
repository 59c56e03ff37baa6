//! Handler registration and routing.

use crate::protocol::Message;
use crate::protocol::message::is_reserved;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Application logic behind one message identifier.
///
/// The returned string is sent back as the acknowledgment body. An empty
/// string suppresses the reply.
pub trait Handler: Send + Sync + 'static {
    /// Handle an incoming message.
    fn handle(&self, message: &Message) -> String;
}

impl<F> Handler for F
where
    F: Fn(&Message) -> String + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) -> String {
        self(message)
    }
}

/// Registry mapping identifiers to handlers.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `identifier`, replacing any previous one.
    ///
    /// Returns `false` and installs nothing if the identifier is in the
    /// reserved control namespace.
    pub fn register<H: Handler>(&self, identifier: impl Into<String>, handler: H) -> bool {
        let identifier = identifier.into();
        if is_reserved(&identifier) {
            warn!("Refusing to register reserved identifier: {identifier}");
            return false;
        }

        info!("Registered handler for identifier: {identifier}");
        self.handlers.insert(identifier, Arc::new(handler));
        true
    }

    /// Find the handler for `identifier`.
    #[must_use]
    pub fn lookup(&self, identifier: &str) -> Option<Arc<dyn Handler>> {
        if is_reserved(identifier) {
            return None;
        }
        self.handlers.get(identifier).map(|h| Arc::clone(h.value()))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
