//! Per-connection session state machine.
//!
//! A [`Session`] is owned by exactly one connection and only changes in
//! response to that connection's inbound traffic. Every inbound stanza is
//! classified ([`InboundClass`]) and checked against the current state with
//! [`Session::admit`] before any handler sees it. Anything not legal for the
//! current state is a [`XmppError::ProtocolPolicyViolation`]; the caller must
//! terminate the session.
//!
//! ```text
//! Connected --starttls--> TlsNegotiating --handshake--> Connected (tls)
//!     |                                                     |
//!     +---------------- stream open ------------------------+
//!                             v
//!                      Authenticating --sasl success--> Authenticated --bind--> Bound
//!
//! any state --terminate(cause)--> Terminating --close--> Closed
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::Entity;
use crate::parser::{ns, StreamHeader};
use crate::stanza::{Stanza, StanzaKind};
use crate::types::{SessionState, TerminationCause, TlsPolicy};
use crate::XmppError;

/// Negotiation policy applied to every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Whether STARTTLS is offered and required
    pub tls: TlsPolicy,
    /// Failed SASL attempts before the session is terminated
    pub max_auth_attempts: u32,
    /// Advertised SASL mechanisms, in preference order
    pub mechanisms: Vec<String>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            tls: TlsPolicy::Optional,
            max_auth_attempts: 3,
            mechanisms: vec!["PLAIN".to_string()],
        }
    }
}

/// What an inbound stanza means to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundClass {
    /// `<stream:stream>` (initial or restart)
    StreamOpen,
    /// `</stream:stream>`
    StreamClose,
    /// `<starttls/>`
    StartTls,
    /// SASL `<auth/>`
    SaslAuth,
    /// SASL `<response/>`
    SaslResponse,
    /// SASL `<abort/>`
    SaslAbort,
    /// `<iq type='set'>` carrying `<bind/>`
    ResourceBind,
    /// Ordinary message, presence or iq traffic
    Content(StanzaKind),
    /// Any other top-level element
    Other,
}

impl InboundClass {
    /// Classify a stanza.
    pub fn of(stanza: &Stanza) -> Self {
        let element = stanza.element();
        match (stanza.kind(), element.namespace()) {
            (StanzaKind::StreamCommand, ns::TLS) if element.name() == "starttls" => Self::StartTls,
            (StanzaKind::StreamCommand, ns::SASL) => match element.name() {
                "auth" => Self::SaslAuth,
                "response" => Self::SaslResponse,
                "abort" => Self::SaslAbort,
                _ => Self::Other,
            },
            (StanzaKind::StreamCommand, _) => Self::Other,
            (StanzaKind::Iq, _)
                if stanza.stanza_type() == Some("set")
                    && stanza
                        .first_child()
                        .is_some_and(|c| c.is("bind", ns::BIND)) =>
            {
                Self::ResourceBind
            }
            (kind, _) => Self::Content(kind),
        }
    }
}

/// What a [`TerminationListener`] learns about a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Session identifier
    pub session_id: String,
    /// Bound full entity, or the authenticated bare entity
    pub entity: Option<Entity>,
    /// State the session was in when termination began
    pub last_state: SessionState,
}

/// Notified once per session when it terminates (presence broadcast, cleanup).
pub trait TerminationListener: Send + Sync + 'static {
    fn session_terminated(&self, summary: &SessionSummary, cause: TerminationCause);
}

/// Server-side state for one connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: SessionState,
    policy: SessionPolicy,
    stream_open: bool,
    tls_engaged: bool,
    authenticated: bool,
    sasl_mechanism: Option<String>,
    auth_failures: u32,
    peer_entity: Option<Entity>,
    bound_resource: Option<String>,
    lang: Option<String>,
    termination: Option<(TerminationCause, SessionState)>,
}

impl Session {
    pub fn new(id: impl Into<String>, policy: SessionPolicy) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Connected,
            policy,
            stream_open: false,
            tls_engaged: false,
            authenticated: false,
            sasl_mechanism: None,
            auth_failures: 0,
            peer_entity: None,
            bound_resource: None,
            lang: None,
            termination: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_open
    }

    pub fn is_tls_engaged(&self) -> bool {
        self.tls_engaged
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The authenticated (bare) peer entity.
    pub fn peer_entity(&self) -> Option<&Entity> {
        self.peer_entity.as_ref()
    }

    pub fn bound_resource(&self) -> Option<&str> {
        self.bound_resource.as_deref()
    }

    /// The full entity once a resource is bound.
    pub fn bound_entity(&self) -> Option<Entity> {
        let peer = self.peer_entity.as_ref()?;
        let resource = self.bound_resource.as_deref()?;
        peer.with_resource(resource).ok()
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures
    }

    /// Mechanism of the SASL exchange in progress, if any.
    pub fn sasl_mechanism(&self) -> Option<&str> {
        self.sasl_mechanism.as_deref()
    }

    pub fn termination_cause(&self) -> Option<TerminationCause> {
        self.termination.map(|(cause, _)| cause)
    }

    /// Whether STARTTLS should be advertised right now.
    pub fn tls_offered(&self) -> bool {
        self.policy.tls != TlsPolicy::Disabled && !self.tls_engaged
    }

    /// Check that an inbound item of class `class` is legal now.
    pub fn admit(&self, class: InboundClass) -> Result<(), XmppError> {
        if self.state.is_terminal() {
            return Err(XmppError::policy_violation(format!(
                "{:?} received while {}",
                class, self.state
            )));
        }

        let legal = match class {
            InboundClass::StreamClose => true,
            InboundClass::StreamOpen => {
                !self.stream_open && self.state != SessionState::TlsNegotiating
            }
            _ if !self.stream_open => false,
            InboundClass::StartTls => {
                matches!(
                    self.state,
                    SessionState::Connected | SessionState::Authenticating
                ) && !self.tls_engaged
                    && self.sasl_mechanism.is_none()
            }
            InboundClass::SaslAuth => {
                self.state == SessionState::Authenticating && self.sasl_mechanism.is_none()
            }
            InboundClass::SaslResponse | InboundClass::SaslAbort => {
                self.state == SessionState::Authenticating && self.sasl_mechanism.is_some()
            }
            InboundClass::ResourceBind => self.state == SessionState::Authenticated,
            InboundClass::Content(_) | InboundClass::Other => self.state == SessionState::Bound,
        };

        if legal {
            Ok(())
        } else {
            Err(XmppError::policy_violation(format!(
                "{:?} is not allowed in state {} (stream open: {})",
                class, self.state, self.stream_open
            )))
        }
    }

    /// A stream header was accepted.
    pub fn open_stream(&mut self, header: &StreamHeader) {
        self.stream_open = true;
        if header.lang.is_some() {
            self.lang = header.lang.clone();
        }
        if self.state == SessionState::Connected
            && (self.tls_engaged || self.policy.tls != TlsPolicy::Required)
        {
            self.transition(SessionState::Authenticating);
        }
    }

    /// STARTTLS was accepted; the byte stream is about to be replaced.
    pub fn begin_tls(&mut self) -> Result<(), XmppError> {
        self.admit(InboundClass::StartTls)?;
        self.stream_open = false;
        self.transition(SessionState::TlsNegotiating);
        Ok(())
    }

    /// The TLS handshake finished; a fresh stream header must follow.
    pub fn tls_established(&mut self) -> Result<(), XmppError> {
        if self.state != SessionState::TlsNegotiating {
            return Err(XmppError::policy_violation(format!(
                "TLS established while {}",
                self.state
            )));
        }
        self.tls_engaged = true;
        self.stream_open = false;
        self.transition(SessionState::Connected);
        Ok(())
    }

    /// A multi-step SASL exchange continues with `mechanism`.
    pub fn sasl_challenge(&mut self, mechanism: &str) -> Result<(), XmppError> {
        self.expect(SessionState::Authenticating)?;
        self.sasl_mechanism = Some(mechanism.to_string());
        Ok(())
    }

    /// The client aborted the SASL exchange.
    pub fn sasl_aborted(&mut self) {
        self.sasl_mechanism = None;
    }

    /// SASL succeeded for `entity` (a bare entity); a stream restart must follow.
    pub fn authenticated(&mut self, entity: Entity) -> Result<(), XmppError> {
        self.expect(SessionState::Authenticating)?;
        self.authenticated = true;
        self.peer_entity = Some(entity.bare());
        self.sasl_mechanism = None;
        self.stream_open = false;
        self.transition(SessionState::Authenticated);
        Ok(())
    }

    /// Record a failed SASL attempt and return the total so far.
    pub fn authentication_failed(&mut self) -> u32 {
        self.sasl_mechanism = None;
        self.auth_failures += 1;
        self.auth_failures
    }

    /// Whether the failed attempts have used up the policy's allowance.
    pub fn auth_attempts_exhausted(&self) -> bool {
        self.auth_failures >= self.policy.max_auth_attempts
    }

    /// Bind `resource` and enter the established state. Returns the full entity.
    pub fn bind(&mut self, resource: &str) -> Result<Entity, XmppError> {
        self.expect(SessionState::Authenticated)?;
        let peer = self
            .peer_entity
            .as_ref()
            .ok_or_else(|| XmppError::internal("authenticated session without entity"))?;
        let full = peer.with_resource(resource)?;
        self.bound_resource = Some(resource.to_string());
        self.transition(SessionState::Bound);
        Ok(full)
    }

    /// Begin termination. Only the first cause is kept; returns whether this
    /// call started the termination.
    pub fn terminate(&mut self, cause: TerminationCause) -> bool {
        if self.termination.is_some() {
            return false;
        }
        self.termination = Some((cause, self.state));
        self.transition(SessionState::Terminating);
        true
    }

    pub fn close(&mut self) {
        self.transition(SessionState::Closed);
    }

    /// Snapshot for termination listeners.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            entity: self.bound_entity().or_else(|| self.peer_entity.clone()),
            last_state: self
                .termination
                .map(|(_, state)| state)
                .unwrap_or(self.state),
        }
    }

    fn expect(&self, state: SessionState) -> Result<(), XmppError> {
        if self.state != state {
            return Err(XmppError::policy_violation(format!(
                "expected state {}, session is {}",
                state, self.state
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session_id = %self.id, from = %self.state, to = %next, "Session state transition");
            self.state = next;
        }
    }
}
