//! Legacy session establishment (RFC 3921 Section 3).
//!
//! Kept for older clients; modern ones see `<optional/>` in the feature and
//! skip the request.

use crate::handler::{Handler, HandlerOutcome, SessionContext};
use crate::stanza::{Stanza, StanzaBuilder};
use crate::XmppError;

/// Answers `<iq type='set'><session/></iq>` with an empty result.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionEstablishmentHandler;

impl Handler for SessionEstablishmentHandler {
    fn handle(&self, stanza: &Stanza, _ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        if stanza.stanza_type() != Some("set") {
            return Err(XmppError::bad_request(Some("session request must be type='set'".into())));
        }
        Ok(HandlerOutcome::reply(StanzaBuilder::iq_result(stanza)?.build()?))
    }
}
