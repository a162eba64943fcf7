use std::{net::SocketAddr, sync::Arc};

use super::{ChannelResult, Message};

/// One authenticated, framed duplex connection provided by the transport layer.
///
/// Underlays are owned by the transport; channels only keep shared references to them.
pub trait Underlay: Send + Sync + 'static {
    /// Identity of the remote side, as established by the handshake.
    fn id(&self) -> &str;

    fn remote_addr(&self) -> SocketAddr;

    /// Bonding group announced by the remote side, if any. Underlays without a group
    /// are bonded by their remote address.
    fn group(&self) -> Option<&str> {
        None
    }

    fn label(&self) -> String {
        format!("u{{{}}}->{}", self.id(), self.remote_addr())
    }

    fn send(&self, msg: &Message) -> ChannelResult<()>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Identity comparison for shared underlays; `id()` is shared by every member of a group.
pub(crate) fn same_underlay(a: &Arc<dyn Underlay>, b: &Arc<dyn Underlay>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
