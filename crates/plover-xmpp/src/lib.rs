//! # plover-xmpp
//!
//! XMPP server core: stream parsing, session state, handler dispatch and the
//! client-to-server listener.
//!
//! This crate implements the RFC 6120 stream lifecycle and leaves everything
//! above it to pluggable handlers, so extension protocols can be added
//! without touching the core.
//!
//! ## Architecture
//!
//! - **Server**: TCP listener for client connections (C2S), with STARTTLS
//! - **Connections**: One tokio task per client, driving an incremental
//!   [`parser::XmlParser`] and a [`dispatch::Dispatcher`]
//! - **Sessions**: A fail-closed state machine deciding which stanzas are
//!   legal at each negotiation step
//! - **Handlers**: Sealed per-namespace dictionaries composed into a
//!   [`registry::HandlerLookup`] at startup
//! - **Worker pool**: A bounded number of dispatches and deferred handler
//!   tasks running at once across all sessions
//!
//! ## XEP Support
//!
//! - RFC 6120 (XMPP Core): STARTTLS, SASL PLAIN, resource binding
//! - RFC 3921 session establishment (legacy, optional)
//! - RFC 6121 message delivery between bound sessions ([`im`])
//! - XEP-0049 (Private XML Storage)
//! - XEP-0199 (XMPP Ping)

pub mod connection;
pub mod dispatch;
pub mod entity;
pub mod handler;
pub mod ids;
pub mod im;
pub mod negotiation;
pub mod parser;
pub mod pool;
pub mod registry;
pub mod server;
pub mod session;
pub mod stanza;
pub mod storage;
pub mod xep;

mod error;
mod types;

pub use connection::{Connection, ConnectionContext, ConnectionSettings};
pub use entity::Entity;
pub use error::{StanzaErrorCondition, StanzaErrorType, StreamErrorCondition, XmppError};
pub use handler::{Handler, HandlerOutcome, SessionAction, SessionContext};
pub use negotiation::{Authenticator, CredentialStore, PlainAuthenticator};
pub use parser::{ns, ParserLimits, StreamHeader};
pub use registry::{HandlerLookup, HandlerLookupBuilder, NamespaceDictionary, Phase, ResourceRegistry};
pub use server::{XmppServer, XmppServerBuilder, XmppServerConfig};
pub use session::{SessionPolicy, SessionSummary, TerminationListener};
pub use stanza::{Stanza, StanzaBuilder, StanzaElement, StanzaKind};
pub use storage::{MemoryStorage, StorageProvider};
pub use types::*;
