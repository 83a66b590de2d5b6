//! Resource registry implementation.
//!
//! Tracks bound sessions by their full entity for stanza delivery.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::entity::Entity;
use crate::stanza::Stanza;

/// Where stanzas for one session are delivered.
#[derive(Debug, Clone)]
pub struct RouteHandle {
    session_id: Arc<str>,
    sender: mpsc::Sender<Stanza>,
}

impl RouteHandle {
    pub fn new(session_id: &str, sender: mpsc::Sender<Stanza>) -> Self {
        Self {
            session_id: Arc::from(session_id),
            sender,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Result of attempting to deliver a stanza to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Stanza was queued for delivery
    Sent,
    /// No session is bound to the address
    NotConnected,
    /// The recipient's channel is full (backpressure)
    ChannelFull,
    /// The recipient's channel is closed
    ChannelClosed,
}

/// Registry of bound resources.
///
/// Thread-safe map from full entity to [`RouteHandle`], using DashMap for
/// concurrent access without explicit locking. A full entity is bound by at
/// most one session at a time.
pub struct ResourceRegistry {
    routes: DashMap<Entity, RouteHandle>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        info!("Creating resource registry");
        Self {
            routes: DashMap::new(),
        }
    }

    /// Reserve `entity` for the session behind `handle`.
    ///
    /// Returns false (and leaves the existing binding alone) when the entity
    /// is already bound or is not a full entity.
    #[instrument(skip(self, handle), fields(entity = %entity, session_id = %handle.session_id()))]
    pub fn try_register(&self, entity: Entity, handle: RouteHandle) -> bool {
        if entity.is_bare() {
            warn!("Refusing to register a bare entity");
            return false;
        }
        match self.routes.entry(entity) {
            Entry::Occupied(_) => {
                debug!("Resource already bound");
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                debug!("Registered resource");
                true
            }
        }
    }

    /// Release `entity` if it is still bound by `session_id`.
    #[instrument(skip(self), fields(entity = %entity))]
    pub fn unregister(&self, entity: &Entity, session_id: &str) -> bool {
        let removed = self
            .routes
            .remove_if(entity, |_, handle| handle.session_id() == session_id)
            .is_some();
        if removed {
            debug!("Unregistered resource");
        }
        removed
    }

    pub fn is_bound(&self, entity: &Entity) -> bool {
        self.routes.contains_key(entity)
    }

    /// Number of bound resources.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All bound full entities sharing `bare`'s node and domain.
    pub fn resources_for(&self, bare: &Entity) -> Vec<Entity> {
        let bare = bare.bare();
        self.routes
            .iter()
            .filter(|entry| entry.key().bare() == bare)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Deliver `stanza` to the session bound to `entity`.
    #[instrument(skip(self, stanza), fields(to = %entity))]
    pub fn send_to(&self, entity: &Entity, stanza: Stanza) -> SendResult {
        let sender = match self.routes.get(entity) {
            Some(entry) => entry.value().sender.clone(),
            None => {
                debug!("Recipient not bound");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(stanza) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed, removing stale route");
                self.routes.remove(entity);
                SendResult::ChannelClosed
            }
        }
    }

    /// Deliver `stanza` by its `to` address.
    ///
    /// A full address reaches that resource; a bare address reaches every
    /// bound resource of the account.
    pub fn route(&self, stanza: Stanza) -> SendResult {
        let to = match stanza.to() {
            Ok(Some(to)) => to,
            _ => return SendResult::NotConnected,
        };
        if !to.is_bare() {
            return self.send_to(&to, stanza);
        }

        let mut result = SendResult::NotConnected;
        for resource in self.resources_for(&to) {
            if self.send_to(&resource, stanza.clone()) == SendResult::Sent {
                result = SendResult::Sent;
            }
        }
        result
    }

    /// Remove routes whose channel is closed.
    pub fn cleanup_stale(&self) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, handle| !handle.sender.is_closed());
        let removed = before.saturating_sub(self.routes.len());
        if removed > 0 {
            info!(count = removed, "Cleaned up stale routes");
        }
        removed
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resource_count", &self.routes.len())
            .finish()
    }
}
