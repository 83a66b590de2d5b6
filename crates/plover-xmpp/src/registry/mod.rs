//! Handler registries and the resource routing table.
//!
//! - [`NamespaceDictionary`]: `(namespace, element) -> handler` for one
//!   namespace, sealed once at startup and read-only afterwards.
//! - [`HandlerLookup`]: the dictionaries of a server, grouped by negotiation
//!   [`Phase`] and by component subdomain. Built with [`HandlerLookupBuilder`].
//! - [`ResourceRegistry`]: bound full entities mapped to their session's
//!   outbound channel, for delivery between sessions.
//!
//! ```text
//! Session (alice@example.com/phone) <-> ResourceRegistry <-> Session (bob@example.com/laptop)
//!            |                                |                          |
//!            v                                v                          v
//!      mpsc::Sender                   DashMap<Entity,              mpsc::Sender
//!                                      RouteHandle>
//! ```

mod dictionary;
mod lookup;
mod resource_registry;

pub use dictionary::NamespaceDictionary;
pub use lookup::{lookup_key, HandlerLookup, HandlerLookupBuilder, Phase, Resolution};
pub use resource_registry::{ResourceRegistry, RouteHandle, SendResult};
