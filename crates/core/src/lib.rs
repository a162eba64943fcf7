/// Bonded multi-underlay logical channels.
pub mod channel;

/// Router node configuration, including control-channel listeners.
pub mod config;

/// Control channel acceptance, registry and reconnect notifications.
pub mod ctrl;

/// Link table shared by the data plane.
pub mod forwarder;

/// Management records and the in-memory router store.
pub mod management;

/// Router context shared by the acceptors.
pub mod router;

/// Logging infrastructure.
pub mod tracing;

/// Router-to-router links.
pub mod xlink;

pub use router::{Router, RouterStatus};

/// Exports for embedding a router.
pub mod prelude {
    pub use crate::channel::{
        BindHandler, BindHandlerFn, BindHandlers, Binding, ChannelError, ChannelState, Message,
        MultiChannel, Underlay,
    };
    pub use crate::config::{CtrlChanListeners, RawCtrlChanListeners, RouterConfig};
    pub use crate::ctrl::{CtrlChannelAcceptor, CtrlChannelError, ReconnectEvent};
    pub use crate::forwarder::{Forwarder, ForwarderError};
    pub use crate::management::{RouterCreate, RouterDetail, RouterPatch, RouterStore};
    pub use crate::router::Router;
    pub use crate::xlink::{LinkAcceptor, Xlink, XlinkAccepter};
}
