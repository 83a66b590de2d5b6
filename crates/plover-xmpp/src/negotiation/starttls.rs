//! STARTTLS (RFC 6120 Section 5).

use tracing::{debug, warn};

use super::empty_element;
use crate::handler::{Handler, HandlerOutcome, SessionAction, SessionContext};
use crate::parser::ns;
use crate::stanza::Stanza;
use crate::types::{TerminationCause, TlsPolicy};
use crate::XmppError;

/// Answers `<starttls/>` with `<proceed/>`, or `<failure/>` when TLS is off.
///
/// After a failure the stream is closed without a stream error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartTlsHandler;

impl Handler for StartTlsHandler {
    fn handle(&self, _stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        if ctx.policy().tls == TlsPolicy::Disabled {
            warn!(session_id = %ctx.session_id(), "STARTTLS requested but TLS is disabled");
            return Ok(HandlerOutcome::reply(empty_element("failure", ns::TLS)?)
                .with_action(SessionAction::Terminate(TerminationCause::Error, None)));
        }

        debug!(session_id = %ctx.session_id(), "Accepting STARTTLS");
        Ok(HandlerOutcome::reply(empty_element("proceed", ns::TLS)?)
            .with_action(SessionAction::StartTls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::registry::RouteHandle;
    use crate::session::{Session, SessionPolicy};

    fn run(tls: TlsPolicy) -> HandlerOutcome {
        let session = Session::new(
            "t",
            SessionPolicy {
                tls,
                ..Default::default()
            },
        );
        let server = Entity::domain_only("example.com").unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let route = RouteHandle::new("t", tx);
        let ctx = SessionContext::new(&session, &server, &route);
        let request = empty_element("starttls", ns::TLS).unwrap();
        StartTlsHandler.handle(&request, &ctx).unwrap()
    }

    #[test]
    fn test_proceed_when_enabled() {
        let outcome = run(TlsPolicy::Optional);
        assert_eq!(outcome.responses[0].to_string(), "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert_eq!(outcome.action, Some(SessionAction::StartTls));
    }

    #[test]
    fn test_failure_when_disabled() {
        let outcome = run(TlsPolicy::Disabled);
        assert_eq!(outcome.responses[0].name(), "failure");
        assert_eq!(
            outcome.action,
            Some(SessionAction::Terminate(TerminationCause::Error, None))
        );
    }
}
