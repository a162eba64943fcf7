//! Link table shared by everything that forwards traffic between routers.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;

use crate::xlink::Xlink;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwarderError {
    #[error("link {link_id} is already registered")]
    DuplicateLink { link_id: String },
    #[error("link id must not be empty")]
    InvalidLinkId,
    #[error("link {link_id} has invalid destination {dest_id:?}")]
    InvalidDestination { link_id: String, dest_id: String },
    #[error("link {link_id} points at unknown router {dest_id}")]
    UnknownDestination { link_id: String, dest_id: String },
    #[error("forwarder is closed")]
    Closed,
}

pub struct Forwarder {
    router_id: String,
    links: DashMap<String, Arc<dyn Xlink>>,
    /// Highest iteration seen per destination router.
    latest_iteration: DashMap<String, u32>,
    /// When set, links to routers outside this set are rejected.
    known_routers: RwLock<Option<HashSet<String>>>,
    closed: AtomicBool,
}

impl Forwarder {
    pub fn new(router_id: impl Into<String>) -> Self {
        Self {
            router_id: router_id.into(),
            links: DashMap::new(),
            latest_iteration: DashMap::new(),
            known_routers: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    /// Restricts link destinations to `routers`. `None` accepts any destination.
    pub fn set_known_routers(&self, routers: Option<HashSet<String>>) {
        *self.known_routers.write() = routers;
    }

    /// Adds `link` to the link table.
    ///
    /// At most one link is registered per id; concurrent registrations of the same id
    /// resolve to exactly one success. Links for different iterations of the same
    /// router pair coexist.
    pub fn register_link(&self, link: Arc<dyn Xlink>) -> Result<(), ForwarderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ForwarderError::Closed);
        }
        self.validate(link.as_ref())?;

        match self.links.entry(link.id().to_owned()) {
            Entry::Occupied(_) => {
                tracing::debug!(link_id = %link.id(), "Link already registered");
                return Err(ForwarderError::DuplicateLink {
                    link_id: link.id().to_owned(),
                });
            }
            Entry::Vacant(vac) => {
                vac.insert(link.clone());
            }
        }

        let iteration = link.iteration();
        let mut latest = self
            .latest_iteration
            .entry(link.destination_id().to_owned())
            .or_insert(iteration);
        if iteration < *latest {
            tracing::debug!(
                link_id = %link.id(),
                dest_id = %link.destination_id(),
                iteration,
                latest = *latest,
                "Registered link older than latest iteration"
            );
        } else {
            *latest = iteration;
        }
        Ok(())
    }

    fn validate(&self, link: &dyn Xlink) -> Result<(), ForwarderError> {
        if link.id().trim().is_empty() {
            return Err(ForwarderError::InvalidLinkId);
        }
        let dest_id = link.destination_id();
        if dest_id.trim().is_empty() || dest_id == self.router_id {
            return Err(ForwarderError::InvalidDestination {
                link_id: link.id().to_owned(),
                dest_id: dest_id.to_owned(),
            });
        }
        if let Some(known) = self.known_routers.read().as_ref() {
            if !known.contains(dest_id) {
                return Err(ForwarderError::UnknownDestination {
                    link_id: link.id().to_owned(),
                    dest_id: dest_id.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Removes the link registered under `link_id`.
    pub fn unregister_link(&self, link_id: &str) -> Option<Arc<dyn Xlink>> {
        let (_, link) = self.links.remove(link_id)?;
        tracing::debug!(
            link_id,
            dest_id = %link.destination_id(),
            iteration = link.iteration(),
            "Link unregistered"
        );
        Some(link)
    }

    pub fn link(&self, link_id: &str) -> Option<Arc<dyn Xlink>> {
        self.links.get(link_id).map(|entry| entry.value().clone())
    }

    /// Links to `dest_id`, oldest iteration first.
    pub fn links_to(&self, dest_id: &str) -> Vec<Arc<dyn Xlink>> {
        let mut links: Vec<_> = self
            .links
            .iter()
            .filter(|entry| entry.value().destination_id() == dest_id)
            .map(|entry| entry.value().clone())
            .collect();
        links.sort_by_key(|link| link.iteration());
        links
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn latest_iteration(&self, dest_id: &str) -> Option<u32> {
        self.latest_iteration.get(dest_id).map(|it| *it)
    }

    /// Rejects further registrations and closes every registered link.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, link)) = self.links.remove(&id) {
                link.close();
            }
        }
    }
}
