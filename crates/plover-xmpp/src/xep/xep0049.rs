//! XEP-0049: Private XML Storage
//!
//! Allows users to store arbitrary XML data on the server, keyed by the
//! element name and namespace of the stored fragment. Reads and writes go
//! through a [`StorageProvider`] and complete as deferred work.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::handler::{Handler, HandlerOutcome, SessionContext};
use crate::parser::ns;
use crate::registry::NamespaceDictionary;
use crate::stanza::{Stanza, StanzaBuilder, StanzaElement};
use crate::storage::StorageProvider;
use crate::XmppError;

/// Namespace for private XML storage.
pub const NS_PRIVATE: &str = "jabber:iq:private";

/// Key for private storage: element name + namespace combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrivateStorageKey {
    /// The element name
    pub element_name: String,
    /// The namespace
    pub namespace: String,
}

impl PrivateStorageKey {
    /// Key of the single fragment inside a `<query xmlns='jabber:iq:private'/>`.
    ///
    /// The fragment must be namespaced, and neither the client namespace nor
    /// `jabber:iq:private` itself may be used.
    pub fn from_query(query: &StanzaElement) -> Result<(Self, &StanzaElement), XmppError> {
        let mut children = query.child_elements();
        let fragment = match (children.next(), children.next()) {
            (Some(fragment), None) => fragment,
            (None, _) => {
                return Err(XmppError::bad_request(Some("query has no payload".into())));
            }
            (Some(_), Some(_)) => {
                return Err(XmppError::not_acceptable(Some(
                    "exactly one element per request".into(),
                )));
            }
        };

        match fragment.namespace() {
            "" | ns::JABBER_CLIENT | NS_PRIVATE => Err(XmppError::not_acceptable(Some(format!(
                "namespace '{}' cannot be stored",
                fragment.namespace()
            )))),
            namespace => Ok((
                Self {
                    element_name: fragment.name().to_string(),
                    namespace: namespace.to_string(),
                },
                fragment,
            )),
        }
    }

    /// Key under which the fragment is kept in the storage provider.
    pub fn storage_key(&self) -> String {
        format!("{}#{{{}}}{}", NS_PRIVATE, self.namespace, self.element_name)
    }
}

impl fmt::Display for PrivateStorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.element_name)
    }
}

/// Serves `jabber:iq:private` get and set requests for the bound account.
pub struct PrivateStorageHandler {
    storage: Arc<dyn StorageProvider>,
}

impl PrivateStorageHandler {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    /// The `jabber:iq:private` dictionary, ready to be attached to a phase.
    pub fn dictionary(storage: Arc<dyn StorageProvider>) -> Result<NamespaceDictionary, XmppError> {
        let mut dictionary = NamespaceDictionary::new(NS_PRIVATE);
        dictionary.register(NS_PRIVATE, "query", Self::new(storage))?;
        Ok(dictionary)
    }
}

impl fmt::Debug for PrivateStorageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateStorageHandler").finish_non_exhaustive()
    }
}

impl Handler for PrivateStorageHandler {
    fn handle(&self, stanza: &Stanza, ctx: &SessionContext<'_>) -> Result<HandlerOutcome, XmppError> {
        let set = match stanza.stanza_type() {
            Some("get") => false,
            Some("set") => true,
            _ => return Ok(HandlerOutcome::none()),
        };

        let owner = ctx
            .bound_entity()
            .ok_or_else(|| XmppError::internal("private storage without bound entity"))?;
        if let Some(to) = stanza.to()? {
            if to.bare() != owner.bare() {
                return Err(XmppError::forbidden(Some(
                    "private storage of other accounts is not accessible".into(),
                )));
            }
        }

        let query = stanza
            .first_child()
            .ok_or_else(|| XmppError::bad_request(None))?;
        let (key, fragment) = PrivateStorageKey::from_query(query)?;
        let storage = Arc::clone(&self.storage);
        let request = stanza.clone();

        if set {
            let value = fragment.to_string();
            Ok(HandlerOutcome::deferred(async move {
                debug!(owner = %owner.bare(), key = %key, "Storing private XML");
                storage.put(&owner, &key.storage_key(), value).await?;
                Ok(vec![StanzaBuilder::iq_result(&request)?.build()?])
            }))
        } else {
            Ok(HandlerOutcome::deferred(async move {
                let stored = storage.get(&owner, &key.storage_key()).await?;
                Ok(vec![build_private_storage_result(&request, stored.as_deref(), &key)?])
            }))
        }
    }
}

/// Build a private storage result IQ (response to GET).
///
/// When nothing is stored, or the stored text no longer parses, the reply
/// carries the empty requested element.
pub fn build_private_storage_result(
    request: &Stanza,
    stored: Option<&str>,
    key: &PrivateStorageKey,
) -> Result<Stanza, XmppError> {
    let fragment = stored.and_then(|xml| match xml.parse::<StanzaElement>() {
        Ok(element) => Some(element),
        Err(e) => {
            debug!(key = %key, error = %e, "Stored private XML is unreadable");
            None
        }
    });

    let mut builder = StanzaBuilder::iq_result(request)?;
    builder.start("query", NS_PRIVATE)?;
    match fragment {
        Some(element) => {
            builder.append(element)?;
        }
        None => {
            builder.start(&key.element_name, &key.namespace)?.end()?;
        }
    }
    builder.end()?;
    builder.build()
}
