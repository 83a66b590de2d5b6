//! Sealed namespace dictionaries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::handler::Handler;
use crate::XmppError;

/// Handlers for the elements of one XML namespace.
///
/// Mutable only until [`seal`](Self::seal); a sealed dictionary never changes
/// again and can be shared across workers without synchronization.
pub struct NamespaceDictionary {
    namespace: String,
    handlers: HashMap<String, Arc<dyn Handler>>,
    sealed: bool,
}

impl NamespaceDictionary {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            handlers: HashMap::new(),
            sealed: false,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Register `handler` for `(namespace, name)`.
    ///
    /// Fails without changing anything when the dictionary is sealed, when
    /// `namespace` is not this dictionary's namespace, or when the pair is
    /// already registered.
    pub fn register<H: Handler>(
        &mut self,
        namespace: &str,
        name: &str,
        handler: H,
    ) -> Result<(), XmppError> {
        self.register_arc(namespace, name, Arc::new(handler))
    }

    /// Like [`register`](Self::register) for a handler shared between dictionaries.
    pub fn register_arc(
        &mut self,
        namespace: &str,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), XmppError> {
        if self.sealed {
            return Err(XmppError::registry_state(format!(
                "dictionary '{}' is sealed, cannot register '{}'",
                self.namespace, name
            )));
        }
        if namespace != self.namespace {
            return Err(XmppError::registry_state(format!(
                "namespace '{}' does not belong to dictionary '{}'",
                namespace, self.namespace
            )));
        }
        if self.handlers.contains_key(name) {
            return Err(XmppError::registry_state(format!(
                "duplicate handler for {{{}}}{}",
                namespace, name
            )));
        }
        debug!(namespace = %namespace, element = %name, "Registered handler");
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Forbid all further registration.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Find the handler for `(namespace, name)`.
    pub fn lookup(&self, namespace: &str, name: &str) -> Option<&Arc<dyn Handler>> {
        if namespace != self.namespace {
            return None;
        }
        self.handlers.get(name)
    }

    /// Registered element names, sorted.
    pub fn element_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for NamespaceDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceDictionary")
            .field("namespace", &self.namespace)
            .field("elements", &self.element_names())
            .field("sealed", &self.sealed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::handler::{HandlerOutcome, SessionContext};
    use crate::registry::RouteHandle;
    use crate::session::{Session, SessionPolicy};
    use crate::stanza::{Stanza, StanzaBuilder};

    const NS: &str = "urn:xmpp:ping";

    fn first(_: &Stanza, _: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        Err(XmppError::handler("first"))
    }

    fn second(_: &Stanza, _: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        Err(XmppError::handler("second"))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut dict = NamespaceDictionary::new(NS);
        dict.register(NS, "ping", first).unwrap();

        assert!(dict.lookup(NS, "ping").is_some());
        assert!(dict.lookup(NS, "pong").is_none());
        assert!(dict.lookup("urn:other", "ping").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected_first_wins() {
        let mut dict = NamespaceDictionary::new(NS);
        dict.register(NS, "ping", first).unwrap();

        let result = dict.register(NS, "ping", second);
        assert!(matches!(result, Err(XmppError::RegistryState(_))));
        assert_eq!(dict.len(), 1);

        // The surviving handler is the first one.
        let session = Session::new("t1", SessionPolicy::default());
        let server = Entity::domain_only("example.com").unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let route = RouteHandle::new("t1", tx);
        let ctx = SessionContext::new(&session, &server, &route);
        let stanza = StanzaBuilder::iq("get", "1").build().unwrap();

        match dict.lookup(NS, "ping").unwrap().handle(&stanza, &ctx) {
            Err(XmppError::HandlerProcessing(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_register_after_seal_rejected() {
        let mut dict = NamespaceDictionary::new(NS);
        dict.register(NS, "ping", first).unwrap();
        dict.seal();

        let before = dict.element_names().len();
        let result = dict.register(NS, "other", second);
        assert!(matches!(result, Err(XmppError::RegistryState(_))));
        assert_eq!(dict.element_names().len(), before);
        assert!(dict.lookup(NS, "other").is_none());
        assert!(dict.lookup(NS, "ping").is_some());
    }

    #[test]
    fn test_foreign_namespace_rejected() {
        let mut dict = NamespaceDictionary::new(NS);
        assert!(dict.register("jabber:iq:roster", "query", first).is_err());
        assert!(dict.is_empty());
    }
}
