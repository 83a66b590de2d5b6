//! XEP-0199: XMPP Ping
//!
//! Clients ping the server to check that the stream is still alive. The
//! server answers with an empty result. Pings addressed to other entities
//! are not relayed.

use crate::handler::{Handler, HandlerOutcome, SessionContext};
use crate::registry::NamespaceDictionary;
use crate::stanza::{Stanza, StanzaBuilder};
use crate::XmppError;

/// Namespace for XMPP ping.
pub const NS_PING: &str = "urn:xmpp:ping";

/// Answers `<iq type='get'><ping xmlns='urn:xmpp:ping'/></iq>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

impl PingHandler {
    /// The `urn:xmpp:ping` dictionary, ready to be attached to a phase.
    pub fn dictionary() -> Result<NamespaceDictionary, XmppError> {
        let mut dictionary = NamespaceDictionary::new(NS_PING);
        dictionary.register(NS_PING, "ping", PingHandler)?;
        Ok(dictionary)
    }
}

impl Handler for PingHandler {
    fn handle(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        match stanza.stanza_type() {
            Some("get") => {}
            Some("set") => {
                return Err(XmppError::bad_request(Some("ping must be type='get'".into())));
            }
            // Replies to pings we never sent.
            _ => return Ok(HandlerOutcome::none()),
        }

        if let Some(to) = stanza.to()? {
            let own_account = ctx.peer_entity().is_some_and(|peer| *peer == to.bare());
            if to != *ctx.server_entity() && !own_account {
                return Err(XmppError::service_unavailable(None));
            }
        }

        Ok(HandlerOutcome::reply(StanzaBuilder::iq_result(stanza)?.build()?))
    }
}
