//! Error types for the XMPP server core.

use thiserror::Error;

/// XMPP server errors.
///
/// The first six variants are the protocol taxonomy: each one has a fixed
/// blast radius (connection, stanza, construction attempt or startup), see
/// [`XmppError::is_connection_fatal`].
#[derive(Debug, Error)]
pub enum XmppError {
    /// Malformed wire input. The parser is poisoned and the connection must go.
    #[error("XML syntax error: {0}")]
    XmlSyntax(String),

    /// Invalid address, localized to the offending stanza.
    #[error("Entity format error: {0}")]
    EntityFormat(String),

    /// Misuse of stanza construction, fatal only to that construction attempt.
    #[error("Builder state error: {0}")]
    BuilderState(String),

    /// Handler registration after seal or duplicate registration (startup-fatal).
    #[error("Registry state error: {0}")]
    RegistryState(String),

    /// Stanza illegal in the current session state.
    #[error("Protocol policy violation: {0}")]
    ProtocolPolicyViolation(String),

    /// Handler failed while processing a stanza.
    #[error("Handler processing error: {0}")]
    HandlerProcessing(String),

    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error raised by a handler (for IQ error responses)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new XML syntax error.
    pub fn xml_syntax(msg: impl Into<String>) -> Self {
        Self::XmlSyntax(msg.into())
    }

    /// Create a new entity format error.
    pub fn entity_format(msg: impl Into<String>) -> Self {
        Self::EntityFormat(msg.into())
    }

    /// Create a new builder state error.
    pub fn builder_state(msg: impl Into<String>) -> Self {
        Self::BuilderState(msg.into())
    }

    /// Create a new registry state error.
    pub fn registry_state(msg: impl Into<String>) -> Self {
        Self::RegistryState(msg.into())
    }

    /// Create a new protocol policy violation.
    pub fn policy_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolPolicyViolation(msg.into())
    }

    /// Create a new handler processing error.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerProcessing(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'not-acceptable'.
    pub fn not_acceptable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::NotAcceptable,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::Forbidden,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Whether this error must tear down the connection.
    ///
    /// Per-stanza errors (entity format, handler, stanza) are contained;
    /// everything touching the wire or the negotiation order is not.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::XmlSyntax(_)
                | Self::ProtocolPolicyViolation(_)
                | Self::Io(_)
                | Self::Tls(_)
                | Self::Internal(_)
        )
    }

    /// Map this error onto the stanza error reported to the sender.
    pub fn stanza_condition(&self) -> (StanzaErrorCondition, StanzaErrorType, Option<&str>) {
        match self {
            Self::Stanza {
                condition,
                error_type,
                text,
            } => (*condition, *error_type, text.as_deref()),
            Self::EntityFormat(_) => (
                StanzaErrorCondition::JidMalformed,
                StanzaErrorType::Modify,
                None,
            ),
            Self::BuilderState(_) | Self::HandlerProcessing(_) | Self::Internal(_) => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
                None,
            ),
            _ => (
                StanzaErrorCondition::UndefinedCondition,
                StanzaErrorType::Cancel,
                None,
            ),
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stream error conditions (RFC 6120 Section 4.9.3) used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Stream error: bad format
    BadFormat,
    /// Stream error: host unknown
    HostUnknown,
    /// Stream error: invalid namespace
    InvalidNamespace,
    /// Stream error: not authorized
    NotAuthorized,
    /// Stream error: not well-formed
    NotWellFormed,
    /// Stream error: policy violation
    PolicyViolation,
    /// Stream error: resource constraint
    ResourceConstraint,
    /// Stream error: restricted XML
    RestrictedXml,
    /// Stream error: system shutdown
    SystemShutdown,
    /// Stream error: internal server error
    InternalServerError,
    /// Stream error: unsupported stanza type
    UnsupportedStanzaType,
    /// Stream error: unsupported version
    UnsupportedVersion,
}

impl StreamErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::HostUnknown => "host-unknown",
            Self::InvalidNamespace => "invalid-namespace",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SystemShutdown => "system-shutdown",
            Self::InternalServerError => "internal-server-error",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
