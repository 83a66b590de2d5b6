//! The handler contract implemented by negotiation steps and extension modules.
//!
//! Handlers are registered into a [`NamespaceDictionary`](crate::registry::NamespaceDictionary)
//! at startup and invoked synchronously by the dispatcher with a borrowed,
//! read-only [`SessionContext`]. They never hold on to the session: changes
//! to it are requested through [`SessionAction`] and applied by the
//! dispatcher after the call returns.
//!
//! Slow work (storage, network) must not run inside `handle`. Return it as a
//! deferred future instead; the connection runs it on the worker pool and
//! writes the produced stanzas when it completes.

use futures::future::BoxFuture;

use crate::entity::Entity;
use crate::registry::RouteHandle;
use crate::session::{Session, SessionPolicy};
use crate::stanza::Stanza;
use crate::types::{SessionState, TerminationCause};
use crate::{StreamErrorCondition, XmppError};

/// Work handed off by a handler, producing the stanzas to send when done.
pub type DeferredStanzas = BoxFuture<'static, Result<Vec<Stanza>, XmppError>>;

/// A session change requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// STARTTLS accepted: write the responses, then upgrade the transport
    StartTls,
    /// A SASL exchange is in progress with this mechanism
    SaslChallenge(String),
    /// The client aborted the SASL exchange
    SaslAborted,
    /// SASL succeeded for this (bare) entity
    Authenticated(Entity),
    /// A SASL attempt failed
    AuthenticationFailed,
    /// The resource was reserved and bound
    ResourceBound(String),
    /// End the session, with an optional stream error written first
    Terminate(TerminationCause, Option<StreamErrorCondition>),
}

/// What a handler produced for one stanza.
#[derive(Default)]
pub struct HandlerOutcome {
    /// Stanzas to send immediately, in order
    pub responses: Vec<Stanza>,
    /// Session change to apply after the responses are queued
    pub action: Option<SessionAction>,
    /// Slow work to complete asynchronously
    pub deferred: Option<DeferredStanzas>,
}

impl HandlerOutcome {
    /// Nothing to send.
    pub fn none() -> Self {
        Self::default()
    }

    /// A single immediate response.
    pub fn reply(stanza: Stanza) -> Self {
        Self {
            responses: vec![stanza],
            ..Default::default()
        }
    }

    pub fn replies(stanzas: Vec<Stanza>) -> Self {
        Self {
            responses: stanzas,
            ..Default::default()
        }
    }

    /// Complete later through `future`.
    pub fn deferred<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<Vec<Stanza>, XmppError>> + Send + 'static,
    {
        Self {
            deferred: Some(Box::pin(future)),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: SessionAction) -> Self {
        self.action = Some(action);
        self
    }
}

impl std::fmt::Debug for HandlerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOutcome")
            .field("responses", &self.responses)
            .field("action", &self.action)
            .field("deferred", &self.deferred.is_some())
            .finish()
    }
}

/// Read-only view of a session, valid for one handler call.
pub struct SessionContext<'a> {
    session: &'a Session,
    server: &'a Entity,
    route: &'a RouteHandle,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(session: &'a Session, server: &'a Entity, route: &'a RouteHandle) -> Self {
        Self {
            session,
            server,
            route,
        }
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The authenticated bare entity.
    pub fn peer_entity(&self) -> Option<&Entity> {
        self.session.peer_entity()
    }

    /// The bound full entity.
    pub fn bound_entity(&self) -> Option<Entity> {
        self.session.bound_entity()
    }

    /// This server's domain entity.
    pub fn server_entity(&self) -> &Entity {
        self.server
    }

    /// Language declared on the stream header.
    pub fn lang(&self) -> Option<&str> {
        self.session.lang()
    }

    pub fn is_tls_engaged(&self) -> bool {
        self.session.is_tls_engaged()
    }

    pub fn tls_offered(&self) -> bool {
        self.session.tls_offered()
    }

    pub fn policy(&self) -> &SessionPolicy {
        self.session.policy()
    }

    pub fn auth_failures(&self) -> u32 {
        self.session.auth_failures()
    }

    pub fn sasl_mechanism(&self) -> Option<&str> {
        self.session.sasl_mechanism()
    }

    /// Delivery handle of this session, used when reserving a resource.
    pub fn route_handle(&self) -> &RouteHandle {
        self.route
    }
}

/// A pluggable unit processing one class of stanza.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, stanza: &Stanza, ctx: &SessionContext<'_>)
        -> Result<HandlerOutcome, XmppError>;
}

impl<F> Handler for F
where
    F: Fn(&Stanza, &SessionContext<'_>) -> Result<HandlerOutcome, XmppError>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        stanza: &Stanza,
        ctx: &SessionContext<'_>,
    ) -> Result<HandlerOutcome, XmppError> {
        self(stanza, ctx)
    }
}
