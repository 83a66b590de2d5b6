//! SASL authentication (RFC 6120 Section 6).

use std::collections::HashMap;
use std::sync::Arc;

use base64::prelude::*;
use tracing::{debug, info, warn};

use super::empty_element;
use crate::entity::Entity;
use crate::handler::{Handler, HandlerOutcome, SessionAction, SessionContext};
use crate::parser::ns;
use crate::stanza::{Stanza, StanzaBuilder};
use crate::XmppError;

/// SASL failure conditions (RFC 6120 Section 6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    Aborted,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

/// Result of feeding client data to a mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this challenge and wait for a `<response/>`
    Challenge(Vec<u8>),
    /// Authenticated as this (bare) entity
    Success(Entity),
    Failure(SaslFailure),
}

/// Pluggable SASL mechanism implementation.
///
/// `data` is `None` when the client sent `<auth/>` without an initial
/// response, and `Some` (possibly empty) otherwise. Multi-step mechanisms
/// keep their per-exchange state keyed by `session_id`.
pub trait Authenticator: Send + Sync + 'static {
    /// Mechanisms this authenticator implements.
    fn mechanisms(&self) -> Vec<String>;

    fn step(&self, session_id: &str, mechanism: &str, data: Option<&[u8]>) -> AuthStep;

    /// The exchange for `session_id` was abandoned.
    fn abort(&self, _session_id: &str) {}
}

/// Password verification behind [`PlainAuthenticator`].
pub trait CredentialStore: Send + Sync + 'static {
    fn verify(&self, username: &str, password: &str) -> bool;
}

impl CredentialStore for HashMap<String, String> {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.get(username).is_some_and(|expected| expected == password)
    }
}

/// SASL PLAIN (RFC 4616) against a [`CredentialStore`].
#[derive(Debug)]
pub struct PlainAuthenticator<C> {
    domain: String,
    credentials: C,
}

impl<C: CredentialStore> PlainAuthenticator<C> {
    pub fn new(domain: impl Into<String>, credentials: C) -> Self {
        Self {
            domain: domain.into(),
            credentials,
        }
    }

    /// Parse `authzid NUL authcid NUL passwd`.
    fn verify_message(&self, message: &[u8]) -> AuthStep {
        let parts: Vec<&[u8]> = message.split(|&b| b == 0).collect();
        let [authzid, authcid, password] = parts.as_slice() else {
            return AuthStep::Failure(SaslFailure::MalformedRequest);
        };
        let (Ok(authzid), Ok(authcid), Ok(password)) = (
            std::str::from_utf8(authzid),
            std::str::from_utf8(authcid),
            std::str::from_utf8(password),
        ) else {
            return AuthStep::Failure(SaslFailure::MalformedRequest);
        };

        let entity = match Entity::new(Some(authcid), &self.domain, None) {
            Ok(entity) if !authcid.is_empty() => entity,
            _ => return AuthStep::Failure(SaslFailure::NotAuthorized),
        };
        if !authzid.is_empty() && Entity::parse(authzid).ok().as_ref() != Some(&entity) {
            return AuthStep::Failure(SaslFailure::InvalidAuthzid);
        }

        if self.credentials.verify(authcid, password) {
            AuthStep::Success(entity)
        } else {
            AuthStep::Failure(SaslFailure::NotAuthorized)
        }
    }
}

impl<C: CredentialStore> Authenticator for PlainAuthenticator<C> {
    fn mechanisms(&self) -> Vec<String> {
        vec!["PLAIN".to_string()]
    }

    fn step(&self, _session_id: &str, mechanism: &str, data: Option<&[u8]>) -> AuthStep {
        if mechanism != "PLAIN" {
            return AuthStep::Failure(SaslFailure::InvalidMechanism);
        }
        match data {
            // No initial response: ask for it with an empty challenge.
            None => AuthStep::Challenge(Vec::new()),
            Some(message) => self.verify_message(message),
        }
    }
}

/// Handles `<auth/>`, `<response/>` and `<abort/>`.
pub struct SaslHandler {
    authenticator: Arc<dyn Authenticator>,
}

impl SaslHandler {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    fn auth(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        let mechanism = match stanza.attr("mechanism") {
            Some(m)
                if ctx.policy().mechanisms.iter().any(|p| p == m)
                    && self.authenticator.mechanisms().iter().any(|a| a == m) =>
            {
                m
            }
            other => {
                debug!(mechanism = ?other, "Unsupported SASL mechanism");
                return failure(SaslFailure::InvalidMechanism);
            }
        };

        let text = stanza.element().text();
        let data = match text.trim() {
            "" => None,
            encoded => match decode(encoded) {
                Ok(data) => Some(data),
                Err(f) => return failure(f),
            },
        };
        self.step(ctx, mechanism, data.as_deref())
    }

    fn response(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        let mechanism = ctx
            .sasl_mechanism()
            .ok_or_else(|| XmppError::policy_violation("SASL response without exchange"))?;
        let text = stanza.element().text();
        let data = match text.trim() {
            "" => Vec::new(),
            encoded => match decode(encoded) {
                Ok(data) => data,
                Err(f) => return failure(f),
            },
        };
        self.step(ctx, mechanism, Some(&data))
    }

    fn step(
        &self,
        ctx: &SessionContext<'_>,
        mechanism: &str,
        data: Option<&[u8]>,
    ) -> Result<HandlerOutcome, XmppError> {
        match self.authenticator.step(ctx.session_id(), mechanism, data) {
            AuthStep::Challenge(challenge) => {
                let mut builder = StanzaBuilder::new();
                builder
                    .start("challenge", ns::SASL)?
                    .text(&encode(&challenge))?
                    .end()?;
                Ok(HandlerOutcome::reply(builder.build()?)
                    .with_action(SessionAction::SaslChallenge(mechanism.to_string())))
            }
            AuthStep::Success(entity) => {
                info!(session_id = %ctx.session_id(), entity = %entity, mechanism, "SASL authentication succeeded");
                Ok(HandlerOutcome::reply(empty_element("success", ns::SASL)?)
                    .with_action(SessionAction::Authenticated(entity)))
            }
            AuthStep::Failure(f) => {
                warn!(
                    session_id = %ctx.session_id(),
                    condition = f.as_str(),
                    failures = ctx.auth_failures() + 1,
                    "SASL authentication failed"
                );
                failure(f)
            }
        }
    }
}

impl Handler for SaslHandler {
    fn handle(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        match stanza.name() {
            "auth" => self.auth(stanza, ctx),
            "response" => self.response(stanza, ctx),
            "abort" => {
                self.authenticator.abort(ctx.session_id());
                Ok(HandlerOutcome::reply(failure_element(SaslFailure::Aborted)?)
                    .with_action(SessionAction::SaslAborted))
            }
            other => Err(XmppError::handler(format!("unexpected SASL element <{}>", other))),
        }
    }
}

fn failure_element(condition: SaslFailure) -> Result<Stanza, XmppError> {
    let mut builder = StanzaBuilder::new();
    builder
        .start("failure", ns::SASL)?
        .start(condition.as_str(), ns::SASL)?
        .end()?
        .end()?;
    builder.build()
}

fn failure(condition: SaslFailure) -> Result<HandlerOutcome, XmppError> {
    Ok(HandlerOutcome::reply(failure_element(condition)?)
        .with_action(SessionAction::AuthenticationFailed))
}

/// `=` is the encoding of empty data.
fn decode(encoded: &str) -> Result<Vec<u8>, SaslFailure> {
    if encoded == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| SaslFailure::IncorrectEncoding)
}

fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64_STANDARD.encode(data)
    }
}
