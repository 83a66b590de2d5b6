//! Resource binding (RFC 6120 Section 7).

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::entity::Entity;
use crate::handler::{Handler, HandlerOutcome, SessionAction, SessionContext};
use crate::ids::IdGenerator;
use crate::parser::ns;
use crate::registry::ResourceRegistry;
use crate::stanza::{Stanza, StanzaBuilder};
use crate::XmppError;

/// Generated resources tried before giving up.
const MAX_GENERATED_ATTEMPTS: usize = 8;

/// Reserves a resource in the [`ResourceRegistry`] and reports the full entity.
///
/// The requested resource is used when it is free; otherwise, or when none
/// was requested, a generated one is assigned.
pub struct BindHandler {
    resources: Arc<ResourceRegistry>,
    ids: Arc<dyn IdGenerator>,
}

impl BindHandler {
    pub fn new(resources: Arc<ResourceRegistry>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { resources, ids }
    }

    fn reserve(&self, full: Entity, ctx: &SessionContext<'_>) -> bool {
        self.resources.try_register(full, ctx.route_handle().clone())
    }
}

impl Handler for BindHandler {
    #[instrument(skip(self, stanza, ctx), fields(session_id = %ctx.session_id()))]
    fn handle(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        let peer = ctx
            .peer_entity()
            .ok_or_else(|| XmppError::internal("bind without authenticated entity"))?;

        let requested = stanza
            .first_child()
            .and_then(|bind| bind.find_child("resource", ns::BIND))
            .map(|resource| resource.text().trim().to_string())
            .filter(|resource| !resource.is_empty());

        let mut bound = None;
        if let Some(resource) = requested {
            let full = peer
                .with_resource(&resource)
                .map_err(|e| XmppError::bad_request(Some(e.to_string())))?;
            if self.reserve(full.clone(), ctx) {
                bound = Some(full);
            } else {
                debug!(resource = %resource, "Requested resource in use, generating one");
            }
        }

        if bound.is_none() {
            for _ in 0..MAX_GENERATED_ATTEMPTS {
                let full = peer.with_resource(&self.ids.resource_id())?;
                if self.reserve(full.clone(), ctx) {
                    bound = Some(full);
                    break;
                }
            }
        }

        let full = bound.ok_or_else(|| XmppError::Stanza {
            condition: crate::StanzaErrorCondition::ResourceConstraint,
            error_type: crate::StanzaErrorType::Wait,
            text: Some("no resource available".into()),
        })?;
        let resource = full
            .resource()
            .ok_or_else(|| XmppError::internal("bound entity without resource"))?
            .to_string();

        let mut builder = StanzaBuilder::iq_result(stanza)?;
        builder
            .start("bind", ns::BIND)?
            .start("jid", ns::BIND)?
            .text(&full.to_string())?
            .end()?
            .end()?;

        debug!(entity = %full, "Resource reserved");
        Ok(HandlerOutcome::reply(builder.build()?).with_action(SessionAction::ResourceBound(resource)))
    }
}
