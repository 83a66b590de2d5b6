//! Protocol dispatch engine.
//!
//! A [`Dispatcher`] owns one connection's [`Session`] and turns parser events
//! into a [`DispatchOutcome`]: what to write, what to run in the background,
//! whether to upgrade to TLS and whether the session ended. It never touches
//! the socket itself, which keeps every protocol decision synchronous and
//! testable without I/O.
//!
//! For each stanza the order is fixed:
//!
//! 1. the session admits the stanza class (otherwise: policy violation, the
//!    session is terminated and no handler runs),
//! 2. `to`/`from` are checked (contained per-stanza errors),
//! 3. the handler is resolved for the session's phase,
//! 4. the handler runs and its session action is applied.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::entity::Entity;
use crate::handler::{DeferredStanzas, Handler, SessionAction, SessionContext};
use crate::ids::IdGenerator;
use crate::negotiation::stream_features;
use crate::parser::{ns, StreamHeader};
use crate::registry::{lookup_key, HandlerLookup, Phase, Resolution, ResourceRegistry, RouteHandle};
use crate::session::{InboundClass, Session, SessionPolicy, SessionSummary};
use crate::stanza::{Stanza, StanzaKind};
use crate::types::{SessionState, TerminationCause};
use crate::{StanzaErrorCondition, StanzaErrorType, StreamErrorCondition, XmppError};

/// State shared by every session of a server. Read-only after startup.
pub struct ServerShared {
    /// Sealed handler table
    pub lookup: HandlerLookup,
    /// This server's domain
    pub server: Entity,
    /// Negotiation policy for new sessions
    pub policy: SessionPolicy,
    /// Bound resources
    pub resources: Arc<ResourceRegistry>,
    /// Session, stream and resource identifiers
    pub ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerShared")
            .field("server", &self.server)
            .field("policy", &self.policy)
            .field("resources", &self.resources)
            .finish()
    }
}

/// Something to write to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Our `<stream:stream>` header, already rendered
    StreamHeader(String),
    Stanza(Stanza),
    /// `<stream:error/>` with this condition
    StreamError(StreamErrorCondition),
    /// `</stream:stream>`
    StreamClose,
}

impl Outbound {
    /// The bytes to write, as a top-level child of our stream.
    pub fn to_xml(&self) -> String {
        match self {
            Self::StreamHeader(header) => header.clone(),
            Self::Stanza(stanza) => stanza
                .element()
                .render_in_stream(ns::JABBER_CLIENT, &[("stream", ns::STREAM)]),
            Self::StreamError(condition) => format!(
                "<stream:error><{} xmlns='{}'/></stream:error>",
                condition.as_str(),
                ns::STREAMS_ERRORS
            ),
            Self::StreamClose => "</stream:stream>".to_string(),
        }
    }
}

/// A handler's deferred work together with the request it answers.
pub struct DeferredWork {
    pub request: Stanza,
    pub future: DeferredStanzas,
}

impl std::fmt::Debug for DeferredWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredWork")
            .field("request", &self.request.id())
            .finish()
    }
}

/// Everything one inbound event produced.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Written in order, before anything else happens
    pub outbound: Vec<Outbound>,
    /// Spawned after the writes
    pub deferred: Vec<DeferredWork>,
    /// Upgrade the transport once `outbound` is flushed
    pub upgrade_tls: bool,
    /// The session ended; stop reading and discard queued work
    pub termination: Option<TerminationCause>,
}

impl DispatchOutcome {
    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    fn reply(&mut self, stanza: Stanza) {
        self.outbound.push(Outbound::Stanza(stanza));
    }
}

/// Whether a failure concerning `stanza` may be answered with a stanza error.
///
/// Errors and iq results are never answered, to avoid loops.
pub fn expects_error_reply(stanza: &Stanza) -> bool {
    match stanza.kind() {
        StanzaKind::Iq => matches!(stanza.stanza_type(), Some("get") | Some("set")),
        StanzaKind::Message | StanzaKind::Presence => stanza.stanza_type() != Some("error"),
        StanzaKind::StreamCommand => false,
    }
}

/// The reply for deferred work on `request` that failed with `err`.
pub fn deferred_failure_reply(request: &Stanza, err: &XmppError) -> Option<Stanza> {
    (request.kind() == StanzaKind::Iq && expects_error_reply(request))
        .then(|| request.error_response_for(err))
}

/// Per-connection dispatch engine.
pub struct Dispatcher {
    session: Session,
    shared: Arc<ServerShared>,
    route: RouteHandle,
    /// Whether our header was written on the current stream
    header_sent: bool,
}

impl Dispatcher {
    pub fn new(session: Session, shared: Arc<ServerShared>, route: RouteHandle) -> Self {
        Self {
            session,
            shared,
            route,
            header_sent: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The peer opened (or restarted) its stream.
    #[instrument(skip(self, header), fields(session_id = %self.session.id()))]
    pub fn stream_opened(&mut self, header: &StreamHeader) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        if self.session.state().is_terminal() {
            return out;
        }
        if let Err(e) = self.session.admit(InboundClass::StreamOpen) {
            warn!(error = %e, "Unexpected stream header");
            self.fail(&mut out, TerminationCause::PolicyViolation, Some(StreamErrorCondition::PolicyViolation));
            return out;
        }

        self.send_header(&mut out, header.lang.as_deref());

        if let Err(condition) = header.validate() {
            warn!(condition = %condition, "Rejecting stream header");
            self.fail(&mut out, TerminationCause::Error, Some(condition));
            return out;
        }
        if let Some(to) = &header.to {
            if !to.eq_ignore_ascii_case(self.shared.server.domain()) {
                warn!(to = %to, "Stream addressed to unknown host");
                self.fail(&mut out, TerminationCause::Error, Some(StreamErrorCondition::HostUnknown));
                return out;
            }
        }

        self.session.open_stream(header);
        debug!(state = %self.session.state(), "Stream opened");

        match stream_features(&self.session) {
            Ok(features) => out.reply(features),
            Err(e) => {
                warn!(error = %e, "Failed to build stream features");
                self.fail(&mut out, TerminationCause::Error, Some(StreamErrorCondition::InternalServerError));
            }
        }
        out
    }

    /// Dispatch one complete stanza.
    #[instrument(
        skip(self, stanza),
        fields(session_id = %self.session.id(), element = %stanza.name())
    )]
    pub fn dispatch(&mut self, stanza: Stanza) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        if self.session.state().is_terminal() {
            debug!("Discarding stanza for terminated session");
            return out;
        }

        let class = InboundClass::of(&stanza);
        if let Err(e) = self.session.admit(class) {
            warn!(error = %e, state = %self.session.state(), "Stanza out of order");
            let condition = if self.session.is_authenticated() {
                StreamErrorCondition::PolicyViolation
            } else {
                StreamErrorCondition::NotAuthorized
            };
            self.fail(&mut out, TerminationCause::PolicyViolation, Some(condition));
            return out;
        }

        let to_domain = match self.check_addressing(&stanza) {
            Ok(domain) => domain,
            Err(e) => {
                debug!(error = %e, "Rejecting stanza addressing");
                if expects_error_reply(&stanza) {
                    out.reply(stanza.error_response_for(&e));
                }
                return out;
            }
        };

        let phase = Phase::for_state(self.session.state());
        match self.shared.lookup.resolve(phase, &stanza, to_domain.as_deref()) {
            Resolution::Handler(handler) => self.invoke(handler.as_ref(), stanza, &mut out),
            Resolution::ComponentUnavailable(domain) => {
                debug!(component = %domain, "Component has no handler");
                if expects_error_reply(&stanza) {
                    out.reply(stanza.error_response_for(&XmppError::service_unavailable(None)));
                }
            }
            Resolution::NotFound => self.unhandled(stanza, &mut out),
        }
        out
    }

    /// The peer closed its stream.
    pub fn stream_closed(&mut self) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        if !self.session.state().is_terminal() {
            info!(session_id = %self.session.id(), "Peer closed the stream");
            self.fail(&mut out, TerminationCause::PeerInitiated, None);
        }
        out
    }

    /// The parser failed; the stream cannot continue.
    pub fn syntax_error(&mut self, err: &XmppError) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        warn!(session_id = %self.session.id(), error = %err, "Malformed XML from peer");
        let condition = match err {
            XmppError::XmlSyntax(msg) if msg.contains("restricted XML") => {
                StreamErrorCondition::RestrictedXml
            }
            _ => StreamErrorCondition::NotWellFormed,
        };
        self.fail(&mut out, TerminationCause::Error, Some(condition));
        out
    }

    /// The TLS handshake completed; the peer must open a new stream.
    pub fn tls_established(&mut self) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        match self.session.tls_established() {
            Ok(()) => {
                self.header_sent = false;
                info!(session_id = %self.session.id(), "TLS established");
            }
            Err(e) => {
                warn!(error = %e, "Unexpected TLS completion");
                self.fail(&mut out, TerminationCause::Error, None);
            }
        }
        out
    }

    /// The server is shutting down.
    pub fn shutdown(&mut self) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        self.fail(&mut out, TerminationCause::Administrative, Some(StreamErrorCondition::SystemShutdown));
        out
    }

    /// Terminate from outside the protocol (I/O failure, connection loss).
    pub fn abort(&mut self, cause: TerminationCause) {
        if self.session.terminate(cause) {
            info!(session_id = %self.session.id(), cause = %cause, "Session aborted");
        }
    }

    /// Release the session's resources and close it.
    ///
    /// Returns the summary for termination listeners the first time only.
    pub fn finish(&mut self) -> Option<(SessionSummary, TerminationCause)> {
        if self.session.state() == SessionState::Closed {
            return None;
        }
        self.session.terminate(TerminationCause::PeerInitiated);
        let cause = self
            .session
            .termination_cause()
            .unwrap_or(TerminationCause::PeerInitiated);

        if let Some(entity) = self.session.bound_entity() {
            self.shared.resources.unregister(&entity, self.session.id());
        }
        let summary = self.session.summary();
        self.session.close();

        info!(
            session_id = %summary.session_id,
            entity = ?summary.entity.as_ref().map(|e| e.to_string()),
            cause = %cause,
            "Session closed"
        );
        Some((summary, cause))
    }

    fn invoke(&mut self, handler: &dyn Handler, stanza: Stanza, out: &mut DispatchOutcome) {
        let result = {
            let ctx = SessionContext::new(&self.session, &self.shared.server, &self.route);
            handler.handle(&stanza, &ctx)
        };

        match result {
            Ok(outcome) => {
                for response in outcome.responses {
                    out.reply(response);
                }
                if let Some(action) = outcome.action {
                    self.apply(action, out);
                }
                if let Some(future) = outcome.deferred {
                    if !out.is_terminated() {
                        out.deferred.push(DeferredWork {
                            request: stanza,
                            future,
                        });
                    }
                }
            }
            Err(e) if e.is_connection_fatal() => {
                warn!(error = %e, "Handler failed fatally");
                let (cause, condition) = match e {
                    XmppError::ProtocolPolicyViolation(_) => {
                        (TerminationCause::PolicyViolation, StreamErrorCondition::PolicyViolation)
                    }
                    _ => (TerminationCause::Error, StreamErrorCondition::InternalServerError),
                };
                self.fail(out, cause, Some(condition));
            }
            Err(e) => {
                if stanza.kind() == StanzaKind::Iq && expects_error_reply(&stanza) {
                    debug!(error = %e, "Handler failed, answering with error");
                    out.reply(stanza.error_response_for(&e));
                } else {
                    warn!(error = %e, "Handler failed, dropping stanza");
                }
            }
        }
    }

    fn apply(&mut self, action: SessionAction, out: &mut DispatchOutcome) {
        let result = match action {
            SessionAction::StartTls => {
                let result = self.session.begin_tls();
                out.upgrade_tls = result.is_ok();
                result
            }
            SessionAction::SaslChallenge(mechanism) => self.session.sasl_challenge(&mechanism),
            SessionAction::SaslAborted => {
                self.session.sasl_aborted();
                Ok(())
            }
            SessionAction::Authenticated(entity) => {
                let result = self.session.authenticated(entity);
                if result.is_ok() {
                    self.header_sent = false;
                }
                result
            }
            SessionAction::AuthenticationFailed => {
                let failures = self.session.authentication_failed();
                if self.session.auth_attempts_exhausted() {
                    warn!(failures, "Authentication attempts exhausted");
                    self.fail(out, TerminationCause::PolicyViolation, Some(StreamErrorCondition::NotAuthorized));
                }
                Ok(())
            }
            SessionAction::ResourceBound(resource) => match self.session.bind(&resource) {
                Ok(full) => {
                    info!(entity = %full, "Resource bound");
                    Ok(())
                }
                Err(e) => {
                    if let Some(full) = self
                        .session
                        .peer_entity()
                        .and_then(|peer| peer.with_resource(&resource).ok())
                    {
                        self.shared.resources.unregister(&full, self.session.id());
                    }
                    Err(e)
                }
            },
            SessionAction::Terminate(cause, condition) => {
                self.fail(out, cause, condition);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Session action rejected");
            self.fail(out, TerminationCause::PolicyViolation, Some(StreamErrorCondition::PolicyViolation));
        }
    }

    /// Validate `to` and `from`; returns the destination domain.
    fn check_addressing(&self, stanza: &Stanza) -> Result<Option<String>, XmppError> {
        if stanza.kind() == StanzaKind::StreamCommand {
            return Ok(None);
        }
        let to = stanza.to()?;
        if let Some(from) = stanza.from()? {
            let allowed = match self.session.bound_entity() {
                Some(bound) => from == bound || from == bound.bare(),
                None => self.session.peer_entity() == Some(&from.bare()),
            };
            if !allowed {
                return Err(XmppError::Stanza {
                    condition: StanzaErrorCondition::NotAuthorized,
                    error_type: StanzaErrorType::Auth,
                    text: Some("from does not match the session".into()),
                });
            }
        }
        Ok(to.map(|to| to.domain().to_string()))
    }

    fn unhandled(&mut self, stanza: Stanza, out: &mut DispatchOutcome) {
        let (namespace, element) = lookup_key(&stanza);
        match stanza.kind() {
            StanzaKind::Iq if expects_error_reply(&stanza) => {
                debug!(namespace, element, "No handler, answering service-unavailable");
                out.reply(stanza.error_response_for(&XmppError::service_unavailable(None)));
            }
            StanzaKind::Iq | StanzaKind::Message | StanzaKind::Presence => {
                debug!(namespace, element, kind = %stanza.kind(), "No handler, dropping stanza");
            }
            StanzaKind::StreamCommand => {
                warn!(namespace, element, "Unsupported top-level element");
                self.fail(out, TerminationCause::Error, Some(StreamErrorCondition::UnsupportedStanzaType));
            }
        }
    }

    fn send_header(&mut self, out: &mut DispatchOutcome, lang: Option<&str>) {
        let stream_id = self.shared.ids.next_id();
        out.outbound.push(Outbound::StreamHeader(StreamHeader::response(
            &stream_id,
            self.shared.server.domain(),
            lang,
        )));
        self.header_sent = true;
    }

    /// Begin termination: stream error (if any), then our closing tag.
    fn fail(
        &mut self,
        out: &mut DispatchOutcome,
        cause: TerminationCause,
        condition: Option<StreamErrorCondition>,
    ) {
        let previous = self.session.state();
        if !self.session.terminate(cause) {
            return;
        }
        info!(
            session_id = %self.session.id(),
            state = %previous,
            cause = %cause,
            condition = ?condition.map(|c| c.as_str()),
            "Terminating session"
        );

        // No writes are possible halfway through a TLS handshake.
        if previous != SessionState::TlsNegotiating {
            if !self.header_sent {
                let lang = self.session.lang().map(str::to_string);
                self.send_header(out, lang.as_deref());
            }
            if let Some(condition) = condition {
                out.outbound.push(Outbound::StreamError(condition));
            }
            out.outbound.push(Outbound::StreamClose);
        }
        out.termination = Some(cause);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("session_id", &self.session.id())
            .field("state", &self.session.state())
            .field("header_sent", &self.header_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use base64::prelude::*;
    use tokio::sync::mpsc;

    use crate::handler::HandlerOutcome;
    use crate::ids::SequentialIdGenerator;
    use crate::negotiation::{register_core_handlers, PlainAuthenticator};
    use crate::registry::{HandlerLookupBuilder, NamespaceDictionary};
    use crate::stanza::StanzaBuilder;
    use crate::types::TlsPolicy;
    use crate::xep::PingHandler;

    struct Fixture {
        dispatcher: Dispatcher,
        resources: Arc<ResourceRegistry>,
        messages: Arc<AtomicUsize>,
        _routed: mpsc::Receiver<Stanza>,
    }

    fn fixture(tls: TlsPolicy) -> Fixture {
        let mut accounts = HashMap::new();
        accounts.insert("alice".to_string(), "secret".to_string());
        let resources = Arc::new(ResourceRegistry::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("t"));

        let mut builder = HandlerLookupBuilder::new();
        register_core_handlers(
            &mut builder,
            Arc::new(PlainAuthenticator::new("example.com", accounts)),
            Arc::clone(&resources),
            Arc::clone(&ids),
        )
        .unwrap();

        let messages = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&messages);
        let mut client = NamespaceDictionary::new(ns::JABBER_CLIENT);
        client
            .register(
                ns::JABBER_CLIENT,
                "message",
                move |_: &Stanza, _: &SessionContext<'_>| -> Result<HandlerOutcome, XmppError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::none())
                },
            )
            .unwrap();
        builder
            .add(Phase::Established, client)
            .unwrap()
            .add(Phase::Established, PingHandler::dictionary().unwrap())
            .unwrap()
            .add_component("pubsub.example.com", PingHandler::dictionary().unwrap())
            .unwrap();

        let policy = SessionPolicy {
            tls,
            ..Default::default()
        };
        let shared = Arc::new(ServerShared {
            lookup: builder.build(),
            server: Entity::domain_only("example.com").unwrap(),
            policy: policy.clone(),
            resources: Arc::clone(&resources),
            ids,
        });
        let (tx, rx) = mpsc::channel(4);
        Fixture {
            dispatcher: Dispatcher::new(Session::new("s1", policy), shared, RouteHandle::new("s1", tx)),
            resources,
            messages,
            _routed: rx,
        }
    }

    fn header() -> StreamHeader {
        StreamHeader {
            to: Some("example.com".into()),
            version: Some("1.0".into()),
            namespace: Some(ns::JABBER_CLIENT.into()),
            ..Default::default()
        }
    }

    fn sasl_plain(password: &str) -> Stanza {
        let payload = BASE64_STANDARD.encode(format!("\0alice\0{}", password));
        let mut builder = StanzaBuilder::new();
        builder
            .start("auth", ns::SASL)
            .unwrap()
            .attribute("mechanism", "PLAIN")
            .unwrap()
            .text(&payload)
            .unwrap()
            .end()
            .unwrap();
        builder.build().unwrap()
    }

    fn bind_request() -> Stanza {
        let mut builder = StanzaBuilder::iq("set", "b1");
        builder
            .start("bind", ns::BIND)
            .unwrap()
            .start("resource", ns::BIND)
            .unwrap()
            .text("phone")
            .unwrap()
            .end()
            .unwrap()
            .end()
            .unwrap();
        builder.build().unwrap()
    }

    fn chat(from: Option<&str>) -> Stanza {
        let mut builder = StanzaBuilder::message(Some("chat"));
        builder.attribute("to", "bob@example.com").unwrap();
        if let Some(from) = from {
            builder.attribute("from", from).unwrap();
        }
        builder
            .start("body", ns::JABBER_CLIENT)
            .unwrap()
            .text("hi")
            .unwrap()
            .end()
            .unwrap();
        builder.build().unwrap()
    }

    fn iq_get(id: &str, to: Option<&str>, name: &str, namespace: &str) -> Stanza {
        let mut builder = StanzaBuilder::iq("get", id);
        if let Some(to) = to {
            builder.attribute("to", to).unwrap();
        }
        builder.start(name, namespace).unwrap().end().unwrap();
        builder.build().unwrap()
    }

    fn bound(tls: TlsPolicy) -> Fixture {
        let mut fx = fixture(tls);
        fx.dispatcher.stream_opened(&header());
        let out = fx.dispatcher.dispatch(sasl_plain("secret"));
        assert!(!out.is_terminated());
        fx.dispatcher.stream_opened(&header());
        let out = fx.dispatcher.dispatch(bind_request());
        assert!(!out.is_terminated());
        assert_eq!(fx.dispatcher.session().state(), SessionState::Bound);
        fx
    }

    fn stanzas(out: &DispatchOutcome) -> Vec<&Stanza> {
        out.outbound
            .iter()
            .filter_map(|item| match item {
                Outbound::Stanza(stanza) => Some(stanza),
                _ => None,
            })
            .collect()
    }

    fn error_condition(stanza: &Stanza) -> Option<String> {
        stanza
            .element()
            .find_child("error", ns::JABBER_CLIENT)
            .and_then(|error| error.first_child())
            .map(|condition| condition.name().to_string())
    }

    #[test]
    fn test_stream_open_sends_header_and_features() {
        let mut fx = fixture(TlsPolicy::Disabled);
        let out = fx.dispatcher.stream_opened(&header());

        assert_eq!(out.outbound.len(), 2);
        match &out.outbound[0] {
            Outbound::StreamHeader(xml) => {
                assert!(xml.contains("id='t-1'"));
                assert!(xml.contains("from='example.com'"));
            }
            other => panic!("expected header, got {:?}", other),
        }
        assert_eq!(stanzas(&out)[0].name(), "features");
        assert_eq!(fx.dispatcher.session().state(), SessionState::Authenticating);
    }

    #[test]
    fn test_message_before_auth_is_policy_violation() {
        let mut fx = fixture(TlsPolicy::Disabled);
        fx.dispatcher.stream_opened(&header());
        let out = fx.dispatcher.dispatch(chat(None));

        assert_eq!(
            out.outbound,
            vec![
                Outbound::StreamError(StreamErrorCondition::NotAuthorized),
                Outbound::StreamClose
            ]
        );
        assert_eq!(out.termination, Some(TerminationCause::PolicyViolation));
        assert_eq!(fx.messages.load(Ordering::SeqCst), 0);

        // Nothing more is processed once terminated.
        assert!(fx.dispatcher.dispatch(chat(None)).outbound.is_empty());
    }

    #[test]
    fn test_message_before_required_tls_is_policy_violation() {
        let mut fx = fixture(TlsPolicy::Required);
        let out = fx.dispatcher.stream_opened(&header());
        assert!(matches!(out.outbound[0], Outbound::StreamHeader(_)));
        assert_eq!(fx.dispatcher.session().state(), SessionState::Connected);

        let out = fx.dispatcher.dispatch(chat(None));
        assert_eq!(out.termination, Some(TerminationCause::PolicyViolation));
        assert_eq!(
            out.outbound,
            vec![
                Outbound::StreamError(StreamErrorCondition::NotAuthorized),
                Outbound::StreamClose
            ]
        );
        assert_eq!(fx.messages.load(Ordering::SeqCst), 0);
        assert!(fx.dispatcher.session().state().is_terminal());
    }

    #[test]
    fn test_negotiation_reaches_message_handler() {
        let mut fx = bound(TlsPolicy::Disabled);
        assert!(fx
            .resources
            .is_bound(&Entity::parse("alice@example.com/phone").unwrap()));

        let out = fx.dispatcher.dispatch(chat(None));
        assert!(out.outbound.is_empty());
        assert_eq!(fx.messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_after_auth_offers_bind() {
        let mut fx = fixture(TlsPolicy::Disabled);
        fx.dispatcher.stream_opened(&header());
        let out = fx.dispatcher.dispatch(sasl_plain("secret"));
        assert_eq!(stanzas(&out)[0].name(), "success");

        let out = fx.dispatcher.stream_opened(&header());
        assert!(matches!(out.outbound[0], Outbound::StreamHeader(_)));
        let features = stanzas(&out)[0];
        assert!(features.element().find_child("bind", ns::BIND).is_some());
    }

    #[test]
    fn test_auth_attempts_exhausted() {
        let mut fx = fixture(TlsPolicy::Disabled);
        fx.dispatcher.stream_opened(&header());

        for _ in 0..2 {
            let out = fx.dispatcher.dispatch(sasl_plain("wrong"));
            assert_eq!(stanzas(&out)[0].name(), "failure");
            assert!(!out.is_terminated());
        }
        let out = fx.dispatcher.dispatch(sasl_plain("wrong"));
        assert_eq!(out.termination, Some(TerminationCause::PolicyViolation));
        assert!(out
            .outbound
            .contains(&Outbound::StreamError(StreamErrorCondition::NotAuthorized)));
    }

    #[test]
    fn test_unhandled_iq_is_service_unavailable() {
        let mut fx = bound(TlsPolicy::Disabled);
        let out = fx
            .dispatcher
            .dispatch(iq_get("v1", None, "query", "jabber:iq:version"));

        let replies = stanzas(&out);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].stanza_type(), Some("error"));
        assert_eq!(replies[0].id(), Some("v1"));
        assert_eq!(error_condition(replies[0]).as_deref(), Some("service-unavailable"));
        assert!(!out.is_terminated());
    }

    #[test]
    fn test_unhandled_result_is_dropped() {
        let mut fx = bound(TlsPolicy::Disabled);
        let mut builder = StanzaBuilder::iq("result", "r1");
        builder.start("query", "jabber:iq:version").unwrap().end().unwrap();
        let out = fx.dispatcher.dispatch(builder.build().unwrap());
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn test_ping_is_answered() {
        let mut fx = bound(TlsPolicy::Disabled);
        let out = fx
            .dispatcher
            .dispatch(iq_get("p1", Some("example.com"), "ping", crate::xep::NS_PING));
        let replies = stanzas(&out);
        assert_eq!(replies[0].stanza_type(), Some("result"));
        assert_eq!(replies[0].id(), Some("p1"));
    }

    #[test]
    fn test_component_without_handler() {
        let mut fx = bound(TlsPolicy::Disabled);
        let out = fx.dispatcher.dispatch(iq_get(
            "d1",
            Some("pubsub.example.com"),
            "query",
            "http://jabber.org/protocol/disco#info",
        ));
        assert_eq!(
            error_condition(stanzas(&out)[0]).as_deref(),
            Some("service-unavailable")
        );
    }

    #[test]
    fn test_spoofed_from_is_not_authorized() {
        let mut fx = bound(TlsPolicy::Disabled);
        let out = fx.dispatcher.dispatch(chat(Some("mallory@example.com/x")));

        assert_eq!(error_condition(stanzas(&out)[0]).as_deref(), Some("not-authorized"));
        assert!(!out.is_terminated());
        assert_eq!(fx.messages.load(Ordering::SeqCst), 0);

        fx.dispatcher.dispatch(chat(Some("alice@example.com")));
        assert_eq!(fx.messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_top_level_element() {
        let mut fx = bound(TlsPolicy::Disabled);
        let mut builder = StanzaBuilder::new();
        builder.start("enable", "urn:xmpp:sm:3").unwrap().end().unwrap();
        let out = fx.dispatcher.dispatch(builder.build().unwrap());

        assert!(out
            .outbound
            .contains(&Outbound::StreamError(StreamErrorCondition::UnsupportedStanzaType)));
        assert_eq!(out.termination, Some(TerminationCause::Error));
    }

    #[test]
    fn test_unknown_host() {
        let mut fx = fixture(TlsPolicy::Disabled);
        let out = fx.dispatcher.stream_opened(&StreamHeader {
            to: Some("elsewhere.org".into()),
            ..header()
        });
        assert!(matches!(out.outbound[0], Outbound::StreamHeader(_)));
        assert_eq!(out.outbound[1], Outbound::StreamError(StreamErrorCondition::HostUnknown));
        assert_eq!(out.outbound[2], Outbound::StreamClose);
    }

    #[test]
    fn test_starttls_upgrade_requires_new_stream() {
        let mut fx = fixture(TlsPolicy::Required);
        fx.dispatcher.stream_opened(&header());

        let mut builder = StanzaBuilder::new();
        builder.start("starttls", ns::TLS).unwrap().end().unwrap();
        let out = fx.dispatcher.dispatch(builder.build().unwrap());
        assert!(out.upgrade_tls);
        assert_eq!(stanzas(&out)[0].name(), "proceed");
        assert_eq!(fx.dispatcher.session().state(), SessionState::TlsNegotiating);

        assert!(fx.dispatcher.tls_established().outbound.is_empty());
        assert_eq!(fx.dispatcher.session().state(), SessionState::Connected);

        let out = fx.dispatcher.stream_opened(&header());
        assert!(matches!(out.outbound[0], Outbound::StreamHeader(_)));
        assert_eq!(fx.dispatcher.session().state(), SessionState::Authenticating);
    }

    #[test]
    fn test_syntax_error_conditions() {
        let mut fx = fixture(TlsPolicy::Disabled);
        fx.dispatcher.stream_opened(&header());
        let out = fx
            .dispatcher
            .syntax_error(&XmppError::xml_syntax("restricted XML: markup declaration or comment"));
        assert_eq!(
            out.outbound,
            vec![
                Outbound::StreamError(StreamErrorCondition::RestrictedXml),
                Outbound::StreamClose
            ]
        );

        let mut fx = fixture(TlsPolicy::Disabled);
        let out = fx.dispatcher.syntax_error(&XmppError::xml_syntax("mismatched end tag"));
        // No header was sent yet, so one precedes the error.
        assert!(matches!(out.outbound[0], Outbound::StreamHeader(_)));
        assert_eq!(out.outbound[1], Outbound::StreamError(StreamErrorCondition::NotWellFormed));
    }

    #[test]
    fn test_shutdown_and_finish() {
        let mut fx = bound(TlsPolicy::Disabled);
        let out = fx.dispatcher.shutdown();
        assert_eq!(out.termination, Some(TerminationCause::Administrative));
        assert!(out
            .outbound
            .contains(&Outbound::StreamError(StreamErrorCondition::SystemShutdown)));

        let (summary, cause) = fx.dispatcher.finish().unwrap();
        assert_eq!(cause, TerminationCause::Administrative);
        assert_eq!(summary.session_id, "s1");
        assert_eq!(summary.last_state, SessionState::Bound);
        assert!(fx.resources.is_empty());
        assert!(fx.dispatcher.finish().is_none());
    }

    #[test]
    fn test_peer_close() {
        let mut fx = fixture(TlsPolicy::Disabled);
        fx.dispatcher.stream_opened(&header());
        let out = fx.dispatcher.stream_closed();
        assert_eq!(out.outbound, vec![Outbound::StreamClose]);
        assert_eq!(out.termination, Some(TerminationCause::PeerInitiated));
    }

    #[test]
    fn test_outbound_rendering() {
        assert_eq!(
            Outbound::StreamError(StreamErrorCondition::PolicyViolation).to_xml(),
            "<stream:error><policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>"
        );
        assert_eq!(Outbound::StreamClose.to_xml(), "</stream:stream>");
    }

    #[test]
    fn test_expects_error_reply() {
        assert!(expects_error_reply(&iq_get("a", None, "query", "urn:x")));
        assert!(expects_error_reply(&chat(None)));
        let error = chat(None).error_response(
            StanzaErrorCondition::BadRequest,
            StanzaErrorType::Modify,
            None,
        );
        assert!(!expects_error_reply(&error));
    }
}
