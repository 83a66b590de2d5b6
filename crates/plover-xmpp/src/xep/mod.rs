//! XMPP Extension Protocols (XEPs) Implementation
//!
//! Extension modules are ordinary [`Handler`](crate::handler::Handler)s packed
//! into a [`NamespaceDictionary`](crate::registry::NamespaceDictionary) and
//! attached to [`Phase::Established`](crate::registry::Phase::Established)
//! when the server is built.
//!
//! ## Implemented XEPs
//!
//! - **XEP-0049**: Private XML Storage - Per-account storage of arbitrary
//!   namespaced XML, backed by a [`StorageProvider`](crate::storage::StorageProvider).
//! - **XEP-0199**: XMPP Ping - Application-level keepalive answered by the server.

pub mod xep0049;
pub mod xep0199;

pub use xep0049::{PrivateStorageHandler, PrivateStorageKey, NS_PRIVATE};
pub use xep0199::{PingHandler, NS_PING};
