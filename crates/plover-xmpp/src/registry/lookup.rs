//! Composition of namespace dictionaries into the server's handler table.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::NamespaceDictionary;
use crate::handler::Handler;
use crate::stanza::{Stanza, StanzaKind};
use crate::types::SessionState;
use crate::XmppError;

/// Which dictionaries apply to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Everything before a resource is bound
    Negotiation,
    /// After resource binding
    Established,
}

impl Phase {
    pub fn for_state(state: SessionState) -> Self {
        match state {
            SessionState::Bound => Self::Established,
            _ => Self::Negotiation,
        }
    }
}

/// Outcome of resolving a stanza against the handler table.
#[derive(Clone)]
pub enum Resolution {
    /// A handler is registered for the stanza
    Handler(Arc<dyn Handler>),
    /// Addressed to a component that has no handler for it
    ComponentUnavailable(String),
    /// No handler anywhere
    NotFound,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Handler"),
            Self::ComponentUnavailable(domain) => {
                f.debug_tuple("ComponentUnavailable").field(domain).finish()
            }
            Self::NotFound => f.write_str("NotFound"),
        }
    }
}

type DictionarySet = HashMap<String, NamespaceDictionary>;

/// The qualified name a stanza is looked up by.
///
/// An iq with exactly one payload element is keyed by that payload; every
/// other stanza is keyed by its own name.
pub fn lookup_key(stanza: &Stanza) -> (&str, &str) {
    if stanza.kind() == StanzaKind::Iq {
        let mut payloads = stanza.element().child_elements();
        if let (Some(payload), None) = (payloads.next(), payloads.next()) {
            return (payload.namespace(), payload.name());
        }
    }
    (stanza.namespace(), stanza.name())
}

/// Collects dictionaries and seals them into a [`HandlerLookup`].
#[derive(Default)]
pub struct HandlerLookupBuilder {
    phases: HashMap<Phase, DictionarySet>,
    components: HashMap<String, DictionarySet>,
}

impl HandlerLookupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `dictionary` to `phase`. One dictionary per namespace per phase.
    pub fn add(
        &mut self,
        phase: Phase,
        dictionary: NamespaceDictionary,
    ) -> Result<&mut Self, XmppError> {
        let set = self.phases.entry(phase).or_default();
        insert_unique(set, dictionary, &format!("{:?} phase", phase))?;
        Ok(self)
    }

    /// Attach `dictionary` to the component serving `domain`.
    pub fn add_component(
        &mut self,
        domain: &str,
        dictionary: NamespaceDictionary,
    ) -> Result<&mut Self, XmppError> {
        let domain = domain.to_ascii_lowercase();
        let set = self.components.entry(domain.clone()).or_default();
        insert_unique(set, dictionary, &format!("component {}", domain))?;
        Ok(self)
    }

    /// Seal every dictionary and freeze the table.
    pub fn build(self) -> HandlerLookup {
        let seal = |mut set: DictionarySet| {
            set.values_mut().for_each(NamespaceDictionary::seal);
            set
        };

        let mut phases = self.phases;
        let lookup = HandlerLookup {
            negotiation: seal(phases.remove(&Phase::Negotiation).unwrap_or_default()),
            established: seal(phases.remove(&Phase::Established).unwrap_or_default()),
            components: self
                .components
                .into_iter()
                .map(|(domain, set)| (domain, seal(set)))
                .collect(),
        };

        info!(
            negotiation = lookup.negotiation.len(),
            established = lookup.established.len(),
            components = lookup.components.len(),
            "Handler lookup sealed"
        );
        lookup
    }
}

fn insert_unique(
    set: &mut DictionarySet,
    dictionary: NamespaceDictionary,
    owner: &str,
) -> Result<(), XmppError> {
    if set.contains_key(dictionary.namespace()) {
        return Err(XmppError::registry_state(format!(
            "a dictionary for '{}' already exists in {}",
            dictionary.namespace(),
            owner
        )));
    }
    set.insert(dictionary.namespace().to_string(), dictionary);
    Ok(())
}

/// Immutable handler table shared by all sessions.
#[derive(Debug)]
pub struct HandlerLookup {
    negotiation: DictionarySet,
    established: DictionarySet,
    components: HashMap<String, DictionarySet>,
}

impl HandlerLookup {
    /// Find the handler for `stanza` in `phase`.
    ///
    /// `to_domain` is the stanza's (already validated) destination domain;
    /// established traffic addressed to a registered component is resolved
    /// against that component only.
    pub fn resolve(&self, phase: Phase, stanza: &Stanza, to_domain: Option<&str>) -> Resolution {
        let (namespace, name) = lookup_key(stanza);

        if phase == Phase::Established {
            if let Some(component) = to_domain.and_then(|d| self.components.get_key_value(d)) {
                let (domain, set) = component;
                return match find(set, namespace, name) {
                    Some(handler) => Resolution::Handler(handler),
                    None => Resolution::ComponentUnavailable(domain.clone()),
                };
            }
        }

        let set = match phase {
            Phase::Negotiation => &self.negotiation,
            Phase::Established => &self.established,
        };
        match find(set, namespace, name) {
            Some(handler) => Resolution::Handler(handler),
            None => Resolution::NotFound,
        }
    }

    /// Whether a component is registered for `domain`.
    pub fn is_component(&self, domain: &str) -> bool {
        self.components.contains_key(domain)
    }

    /// Namespaces with registered handlers in `phase` (for feature discovery).
    pub fn namespaces(&self, phase: Phase) -> Vec<&str> {
        let set = match phase {
            Phase::Negotiation => &self.negotiation,
            Phase::Established => &self.established,
        };
        let mut namespaces: Vec<_> = set.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        namespaces
    }
}

fn find(set: &DictionarySet, namespace: &str, name: &str) -> Option<Arc<dyn Handler>> {
    set.get(namespace)
        .and_then(|dictionary| dictionary.lookup(namespace, name))
        .cloned()
}
