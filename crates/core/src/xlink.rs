//! Router-to-router data plane links and their acceptance into the forwarder.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::forwarder::{Forwarder, ForwarderError};

/// An established link to a peer router.
pub trait Xlink: Send + Sync + 'static {
    /// Globally unique link id.
    fn id(&self) -> &str;

    /// Id of the router at the other end.
    fn destination_id(&self) -> &str;

    /// Disambiguates successive links between the same pair of routers. Strictly
    /// increasing across reconnects.
    fn iteration(&self) -> u32;

    /// `true` when this router dialed the link, `false` when it was accepted.
    fn is_dialed(&self) -> bool;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Xlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xlink")
            .field("id", &self.id())
            .field("destination_id", &self.destination_id())
            .field("iteration", &self.iteration())
            .field("dialed", &self.is_dialed())
            .finish()
    }
}

/// Receives links whose handshake has completed.
pub trait LinkAcceptor: Send + Sync {
    fn accept(&self, link: Arc<dyn Xlink>) -> Result<(), ForwarderError>;
}

/// Registers accepted links with the router's forwarder.
#[derive(Clone)]
pub struct XlinkAccepter {
    forwarder: Arc<Forwarder>,
}

impl XlinkAccepter {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }
}

impl LinkAcceptor for XlinkAccepter {
    fn accept(&self, link: Arc<dyn Xlink>) -> Result<(), ForwarderError> {
        self.forwarder.register_link(link.clone())?;
        tracing::info!(
            link_id = %link.id(),
            dest_id = %link.destination_id(),
            iteration = link.iteration(),
            dialed = link.is_dialed(),
            "Accepted new link"
        );
        Ok(())
    }
}

/// Link descriptor without a transport behind it, for wiring and tests.
pub struct MemXlink {
    id: String,
    destination_id: String,
    iteration: u32,
    dialed: bool,
    closed: AtomicBool,
}

impl MemXlink {
    pub fn new(
        id: impl Into<String>,
        destination_id: impl Into<String>,
        iteration: u32,
        dialed: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            destination_id: destination_id.into(),
            iteration,
            dialed,
            closed: AtomicBool::new(false),
        })
    }
}

impl Xlink for MemXlink {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination_id(&self) -> &str {
        &self.destination_id
    }

    fn iteration(&self) -> u32 {
        self.iteration
    }

    fn is_dialed(&self) -> bool {
        self.dialed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
