//! In-memory underlay, used to drive channels without a real transport.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use super::{ChannelError, ChannelResult, Message, Underlay};

pub struct MemUnderlay {
    id: String,
    remote_addr: SocketAddr,
    group: Option<String>,
    sent: Mutex<Vec<Message>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl MemUnderlay {
    pub fn new(id: impl Into<String>, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self::build(id.into(), remote_addr, None))
    }

    pub fn with_group(
        id: impl Into<String>,
        remote_addr: SocketAddr,
        group: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self::build(id.into(), remote_addr, Some(group.into())))
    }

    fn build(id: String, remote_addr: SocketAddr, group: Option<String>) -> Self {
        Self {
            id,
            remote_addr,
            group,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Messages written so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Underlay for MemUnderlay {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    fn send(&self, msg: &Message) -> ChannelResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                underlay: self.label(),
                reason: "underlay closed".into(),
            });
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                underlay: self.label(),
                reason: "write error".into(),
            });
        }
        self.sent.lock().push(msg.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
