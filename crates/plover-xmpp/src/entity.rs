//! XMPP addresses (JIDs).
//!
//! An [`Entity`] is the `node@domain/resource` triple used for routing and
//! identity. Values are validated on construction and immutable afterwards.
//!
//! Absent and empty optional parts are the same thing: construction folds an
//! empty node or resource into `None`, so derived equality, hashing and
//! rendering never see the difference.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::XmppError;

/// Maximum size of any address part, in UTF-8 octets (RFC 7622 Section 3).
pub const MAX_PART_OCTETS: usize = 1023;

const CHAR_AT: char = '@';
const CHAR_SLASH: char = '/';

/// A validated XMPP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Entity {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Entity {
    /// Build an entity from its parts.
    ///
    /// Empty `node`/`resource` are treated as absent. The domain is lowercased.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, XmppError> {
        let node = node.filter(|n| !n.is_empty());
        let resource = resource.filter(|r| !r.is_empty());

        if let Some(node) = node {
            check_length("node", node)?;
            if node.contains(CHAR_AT) || node.contains(CHAR_SLASH) {
                return Err(XmppError::entity_format(format!(
                    "node part contains a separator: {}",
                    node
                )));
            }
        }

        if domain.is_empty() {
            return Err(XmppError::entity_format("domain part is missing"));
        }
        check_length("domain", domain)?;
        if domain.contains(CHAR_AT) || domain.contains(CHAR_SLASH) {
            return Err(XmppError::entity_format(format!(
                "domain part contains a separator: {}",
                domain
            )));
        }

        if let Some(resource) = resource {
            check_length("resource", resource)?;
            if resource.contains(CHAR_SLASH) {
                return Err(XmppError::entity_format(format!(
                    "resource part contains '/': {}",
                    resource
                )));
            }
        }

        Ok(Self {
            node: node.map(str::to_string),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(str::to_string),
        })
    }

    /// Build a domain-only entity (a server or component address).
    pub fn domain_only(domain: &str) -> Result<Self, XmppError> {
        Self::new(None, domain, None)
    }

    /// Parse the textual `[node@]domain[/resource]` form.
    ///
    /// Unlike [`Entity::new`], a separator followed or preceded by nothing
    /// (`@example.org`, `alice@`, `example.org/`) is rejected.
    pub fn parse(text: &str) -> Result<Self, XmppError> {
        let (bare, resource) = match text.split_once(CHAR_SLASH) {
            Some((bare, resource)) => {
                if resource.is_empty() {
                    return Err(XmppError::entity_format("empty resource after '/'"));
                }
                if resource.contains(CHAR_SLASH) {
                    return Err(XmppError::entity_format("multiple '/' separators"));
                }
                (bare, Some(resource))
            }
            None => (text, None),
        };

        let (node, domain) = match bare.split_once(CHAR_AT) {
            Some((node, domain)) => {
                if node.is_empty() {
                    return Err(XmppError::entity_format("empty node before '@'"));
                }
                if domain.is_empty() {
                    return Err(XmppError::entity_format("missing domain after '@'"));
                }
                if domain.contains(CHAR_AT) {
                    return Err(XmppError::entity_format("multiple '@' separators"));
                }
                (Some(node), domain)
            }
            None => (None, bare),
        };

        Self::new(node, domain, resource)
    }

    /// Re-run the length and shape checks against this value.
    ///
    /// Always true for values built through this module; kept for entities
    /// that crossed a serialization boundary or were built by other means.
    pub fn validate(&self) -> bool {
        let node_ok = self.node.as_deref().map_or(true, |n| {
            n.len() <= MAX_PART_OCTETS && !n.contains(CHAR_AT) && !n.contains(CHAR_SLASH)
        });
        let domain_ok = !self.domain.is_empty()
            && self.domain.len() <= MAX_PART_OCTETS
            && !self.domain.contains(CHAR_AT)
            && !self.domain.contains(CHAR_SLASH);
        let resource_ok = self
            .resource
            .as_deref()
            .map_or(true, |r| r.len() <= MAX_PART_OCTETS && !r.contains(CHAR_SLASH));

        node_ok && domain_ok && resource_ok
    }

    /// The node (local) part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The (lowercased) domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this entity carries no resource.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The same entity without its resource.
    pub fn bare(&self) -> Entity {
        Entity {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// The same entity with `resource` attached (replacing any existing one).
    pub fn with_resource(&self, resource: &str) -> Result<Entity, XmppError> {
        Self::new(self.node.as_deref(), &self.domain, Some(resource))
    }
}

fn check_length(part: &str, value: &str) -> Result<(), XmppError> {
    if value.len() > MAX_PART_OCTETS {
        return Err(XmppError::entity_format(format!(
            "{} part is {} octets, limit is {}",
            part,
            value.len(),
            MAX_PART_OCTETS
        )));
    }
    Ok(())
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}{}", node, CHAR_AT)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "{}{}", CHAR_SLASH, resource)?;
        }
        Ok(())
    }
}

impl FromStr for Entity {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Entity::parse(s)
    }
}

impl TryFrom<String> for Entity {
    type Error = XmppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Entity::parse(&value)
    }
}

impl From<Entity> for String {
    fn from(entity: Entity) -> Self {
        entity.to_string()
    }
}

impl TryFrom<&Entity> for jid::Jid {
    type Error = XmppError;

    fn try_from(entity: &Entity) -> Result<Self, Self::Error> {
        entity
            .to_string()
            .parse::<jid::Jid>()
            .map_err(|e| XmppError::entity_format(format!("rejected by jid: {}", e)))
    }
}

impl TryFrom<&jid::Jid> for Entity {
    type Error = XmppError;

    fn try_from(jid: &jid::Jid) -> Result<Self, Self::Error> {
        Entity::parse(&jid.to_string())
    }
}
