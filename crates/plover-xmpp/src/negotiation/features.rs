//! Stream features advertised after each stream header.

use crate::parser::ns;
use crate::session::Session;
use crate::stanza::{Stanza, StanzaBuilder};
use crate::types::{SessionState, TlsPolicy};
use crate::XmppError;

/// The `<stream:features/>` for the session's current state.
///
/// Before authentication: `starttls` (with `required` when the policy
/// demands it) and, once authentication is allowed, `mechanisms`. After
/// authentication: `bind` and an optional `session`.
pub fn stream_features(session: &Session) -> Result<Stanza, XmppError> {
    let policy = session.policy();
    let mut builder = StanzaBuilder::new();
    builder.start("features", ns::STREAM)?;

    match session.state() {
        SessionState::Connected | SessionState::Authenticating => {
            if session.tls_offered() {
                builder.start("starttls", ns::TLS)?;
                if policy.tls == TlsPolicy::Required {
                    builder.start("required", ns::TLS)?.end()?;
                }
                builder.end()?;
            }
            if session.state() == SessionState::Authenticating {
                builder.start("mechanisms", ns::SASL)?;
                for mechanism in &policy.mechanisms {
                    builder.start("mechanism", ns::SASL)?.text(mechanism)?.end()?;
                }
                builder.end()?;
            }
        }
        SessionState::Authenticated => {
            builder.start("bind", ns::BIND)?.end()?;
            builder
                .start("session", ns::SESSION)?
                .start("optional", ns::SESSION)?
                .end()?
                .end()?;
        }
        _ => {}
    }

    builder.end()?;
    builder.build()
}
