//! Stream negotiation: STARTTLS, SASL, resource binding and session establishment.
//!
//! These are ordinary [`Handler`]s registered into the core namespace
//! dictionaries; the only thing special about them is the
//! [`SessionAction`](crate::handler::SessionAction) they return.

mod bind;
mod features;
mod sasl;
mod session;
mod starttls;

use std::sync::Arc;

pub use bind::BindHandler;
pub use features::stream_features;
pub use sasl::{AuthStep, Authenticator, CredentialStore, PlainAuthenticator, SaslFailure, SaslHandler};
pub use session::SessionEstablishmentHandler;
pub use starttls::StartTlsHandler;

use crate::handler::Handler;
use crate::ids::IdGenerator;
use crate::parser::ns;
use crate::registry::{HandlerLookupBuilder, NamespaceDictionary, Phase, ResourceRegistry};
use crate::stanza::{Stanza, StanzaBuilder};
use crate::XmppError;

/// Register the negotiation dictionaries into `builder`.
///
/// STARTTLS, SASL and binding go to [`Phase::Negotiation`]; the legacy
/// session request is answered in [`Phase::Established`].
pub fn register_core_handlers(
    builder: &mut HandlerLookupBuilder,
    authenticator: Arc<dyn Authenticator>,
    resources: Arc<ResourceRegistry>,
    ids: Arc<dyn IdGenerator>,
) -> Result<(), XmppError> {
    let mut tls = NamespaceDictionary::new(ns::TLS);
    tls.register(ns::TLS, "starttls", StartTlsHandler)?;

    let sasl_handler: Arc<dyn Handler> = Arc::new(SaslHandler::new(authenticator));
    let mut sasl = NamespaceDictionary::new(ns::SASL);
    for name in ["auth", "response", "abort"] {
        sasl.register_arc(ns::SASL, name, Arc::clone(&sasl_handler))?;
    }

    let mut bind = NamespaceDictionary::new(ns::BIND);
    bind.register(ns::BIND, "bind", BindHandler::new(resources, ids))?;

    let mut session = NamespaceDictionary::new(ns::SESSION);
    session.register(ns::SESSION, "session", SessionEstablishmentHandler)?;

    builder
        .add(Phase::Negotiation, tls)?
        .add(Phase::Negotiation, sasl)?
        .add(Phase::Negotiation, bind)?
        .add(Phase::Established, session)?;
    Ok(())
}

/// A bare negotiation element such as `<proceed xmlns='...'/>`.
fn empty_element(name: &str, namespace: &str) -> Result<Stanza, XmppError> {
    let mut builder = StanzaBuilder::new();
    builder.start(name, namespace)?.end()?;
    builder.build()
}
