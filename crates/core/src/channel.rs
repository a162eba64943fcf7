//! Logical channels bonded over one or more framed transport connections ("underlays").
//!
//! The transport layer hands over already authenticated underlays; this module only
//! deals with attaching them to a [`MultiChannel`], running the bind-handler chain and
//! tracking the channel lifecycle while members come and go.

use bytes::Bytes;

mod bind;
pub mod mem;
mod multi;
mod underlay;

pub use bind::{
    BindHandler, BindHandlerFn, BindHandlers, Binding, CloseHandler, CloseHandlerFn,
    ReceiveHandler, ReceiveHandlerFn,
};
pub use multi::{
    ChannelState, MultiChannel, MultiChannelConfig, MultiChannelOptions, UnderlayHandler,
    DEFAULT_GRACE_WINDOW, DEFAULT_INBOUND_QUEUE_LEN,
};
pub use underlay::Underlay;

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// A single framed message travelling over a logical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub content_type: u32,
    pub body: Bytes,
}

impl Message {
    pub fn new(content_type: u32, body: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            body: body.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("no underlays available on channel {0}")]
    NoUnderlays(String),
    #[error("underlay {0} is already bound to this channel")]
    AlreadyBound(String),
    #[error("underlay {0} is not a member of this channel")]
    UnknownUnderlay(String),
    #[error("bind failed: {0}")]
    BindFailed(String),
    #[error("send failed on underlay {underlay}: {reason}")]
    SendFailed { underlay: String, reason: String },
    #[error("inbound message queue closed")]
    InboundClosed,
}
