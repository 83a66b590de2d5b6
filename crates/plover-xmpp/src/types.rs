//! Common types for the XMPP server.

use serde::{Deserialize, Serialize};

/// Session state in the XMPP stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connection accepted, stream not yet authenticated
    Connected,
    /// STARTTLS accepted, waiting for the handshake to finish
    TlsNegotiating,
    /// Stream open, SASL negotiation allowed
    Authenticating,
    /// SASL succeeded, waiting for resource binding
    Authenticated,
    /// Resource bound, fully established session
    Bound,
    /// Session is shutting down
    Terminating,
    /// Session closed
    Closed,
}

impl SessionState {
    /// Whether the session has been torn down or is being torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminating | Self::Closed)
    }

    /// Get the lowercase state name (used in log fields).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::TlsNegotiating => "tls-negotiating",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Bound => "bound",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationCause {
    /// The peer closed the stream or the socket
    PeerInitiated,
    /// The server shut the session down (e.g. process shutdown)
    Administrative,
    /// Transport or syntax failure
    Error,
    /// A stanza arrived that is illegal in the current state
    PolicyViolation,
}

impl TerminationCause {
    /// Get the cause name (used in log fields and listeners).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerInitiated => "peer-initiated",
            Self::Administrative => "administrative",
            Self::Error => "error",
            Self::PolicyViolation => "policy-violation",
        }
    }
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport type for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Plain TCP (pre-STARTTLS)
    Tcp,
    /// TCP with TLS (post-STARTTLS)
    TcpTls,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpTls => write!(f, "tcp+tls"),
        }
    }
}

/// Whether STARTTLS is offered and whether it is mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// STARTTLS is never offered
    Disabled,
    /// STARTTLS is offered, plaintext authentication still allowed
    #[default]
    Optional,
    /// Authentication is only allowed after STARTTLS
    Required,
}

impl std::str::FromStr for TlsPolicy {
    type Err = crate::XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "optional" => Ok(Self::Optional),
            "required" => Ok(Self::Required),
            other => Err(crate::XmppError::config(format!(
                "unknown TLS policy: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Terminating.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Bound.is_terminal());
    }

    #[test]
    fn test_tls_policy_from_str() {
        assert_eq!("Required".parse::<TlsPolicy>().unwrap(), TlsPolicy::Required);
        assert_eq!("off".parse::<TlsPolicy>().unwrap(), TlsPolicy::Disabled);
        assert!("maybe".parse::<TlsPolicy>().is_err());
    }
}
