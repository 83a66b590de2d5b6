//! Message delivery between bound sessions (RFC 6121 section 8).
//!
//! A `<message/>` from a bound client is re-addressed with the sender's full
//! entity as `from` and handed to the [`ResourceRegistry`]. A bare `to`
//! reaches every bound resource of that account.

use std::sync::Arc;

use tracing::debug;

use crate::handler::{Handler, HandlerOutcome, SessionContext};
use crate::parser::ns;
use crate::registry::{NamespaceDictionary, ResourceRegistry, SendResult};
use crate::stanza::{Stanza, StanzaBuilder};
use crate::XmppError;

/// Relays `jabber:client` messages to their recipients.
#[derive(Debug, Clone)]
pub struct MessageRelayHandler {
    resources: Arc<ResourceRegistry>,
}

impl MessageRelayHandler {
    pub fn new(resources: Arc<ResourceRegistry>) -> Self {
        Self { resources }
    }

    /// The `jabber:client` dictionary holding the relay for `<message/>`.
    pub fn dictionary(resources: Arc<ResourceRegistry>) -> Result<NamespaceDictionary, XmppError> {
        let mut dictionary = NamespaceDictionary::new(ns::JABBER_CLIENT);
        dictionary.register(ns::JABBER_CLIENT, "message", Self::new(resources))?;
        Ok(dictionary)
    }
}

impl Handler for MessageRelayHandler {
    fn handle(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        let from = ctx
            .bound_entity()
            .ok_or_else(|| XmppError::internal("message relay from unbound session"))?;
        let to = stanza
            .to()?
            .ok_or_else(|| XmppError::bad_request(Some("message without 'to'".into())))?;

        let mut builder = StanzaBuilder::message(stanza.stanza_type());
        builder
            .attribute("to", &to.to_string())?
            .attribute("from", &from.to_string())?;
        if let Some(id) = stanza.id() {
            builder.attribute("id", id)?;
        }
        for child in stanza.element().child_elements() {
            builder.append(child.clone())?;
        }

        match self.resources.route(builder.build()?) {
            SendResult::Sent => Ok(HandlerOutcome::none()),
            // Never bounce an error.
            _ if stanza.stanza_type() == Some("error") => Ok(HandlerOutcome::none()),
            result => {
                debug!(to = %to, result = ?result, "Message not delivered");
                Err(XmppError::service_unavailable(None))
            }
        }
    }
}
