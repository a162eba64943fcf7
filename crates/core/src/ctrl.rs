//! Control channels between this router and its controllers.
//!
//! Every controller connection is a bonded [`MultiChannel`](crate::channel::MultiChannel):
//! additional underlays from the same peer extend the existing logical channel instead
//! of replacing it, so losing one connection does not lose the session.

mod acceptor;
mod notify;
mod registry;

pub use acceptor::{CtrlChannelAcceptor, CtrlUnderlayHandler};
pub use notify::{ReconnectEvent, ReconnectNotifier};
pub use registry::{CtrlChannelStatus, CtrlChannels};

use crate::channel::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum CtrlChannelError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no control channel registered for {address}")]
    NotRegistered { address: String },
    #[error("control channel for {address} was replaced during bind")]
    Replaced { address: String },
    #[error("router is shutting down")]
    ShuttingDown,
}
