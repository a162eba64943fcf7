use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    bind::{BindHandler, Binding, CloseHandler, ReceiveHandler},
    underlay::same_underlay,
    ChannelError, ChannelResult, Message, Underlay,
};

/// Time a channel without members is kept around waiting for a rebind.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(30);
/// Capacity of the inbound queue for messages without a dedicated receive handler.
pub const DEFAULT_INBOUND_QUEUE_LEN: usize = 64;

type TeardownHandler = Box<dyn FnOnce(&MultiChannel) + Send>;

/// Lifecycle of a logical channel.
///
/// ```text
/// Unbound ──bind──> Bound ──last member closed──> Draining ──grace elapsed──> Closed
///                     ^                               │
///                     └────────────bind───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Unbound,
    Bound,
    Draining,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => write!(f, "unbound"),
            Self::Bound => write!(f, "bound"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiChannelOptions {
    pub grace_window: Duration,
    pub inbound_queue_len: usize,
}

impl Default for MultiChannelOptions {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
            inbound_queue_len: DEFAULT_INBOUND_QUEUE_LEN,
        }
    }
}

/// Observes members joining and leaving a channel.
pub trait UnderlayHandler: Send + Sync {
    fn handle_underlay_bound(&self, channel: &MultiChannel, underlay: &Arc<dyn Underlay>);
    fn handle_underlay_closed(&self, channel: &MultiChannel, underlay: &Arc<dyn Underlay>);
}

pub struct MultiChannelConfig {
    pub logical_name: String,
    pub options: MultiChannelOptions,
    pub underlay_handler: Arc<dyn UnderlayHandler>,
}

struct Member {
    underlay: Arc<dyn Underlay>,
    close_handlers: Vec<Arc<dyn CloseHandler>>,
}

struct ChannelInner {
    state: ChannelState,
    members: Vec<Member>,
    /// Bumped on every transition into `Draining`; expiry timers carrying an older
    /// epoch are stale.
    drain_epoch: u64,
    teardown: Vec<TeardownHandler>,
}

/// One logical session backed by a changing set of underlays.
pub struct MultiChannel {
    logical_name: String,
    options: MultiChannelOptions,
    underlay_handler: Arc<dyn UnderlayHandler>,
    /// Serializes bind, unbind, expiry and close for this channel.
    membership: tokio::sync::Mutex<()>,
    inner: Mutex<ChannelInner>,
    receive_handlers: RwLock<HashMap<u32, Arc<dyn ReceiveHandler>>>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    next_member: AtomicUsize,
}

impl MultiChannel {
    /// Creates a channel without members.
    pub fn new(config: MultiChannelConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.options.inbound_queue_len.max(1));
        Arc::new(Self {
            logical_name: config.logical_name,
            options: config.options,
            underlay_handler: config.underlay_handler,
            membership: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Unbound,
                members: Vec::new(),
                drain_epoch: 0,
                teardown: Vec::new(),
            }),
            receive_handlers: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            next_member: AtomicUsize::new(0),
        })
    }

    /// Creates a channel and binds its initial member.
    pub async fn open(
        config: MultiChannelConfig,
        bind_handler: &dyn BindHandler,
        underlay: Arc<dyn Underlay>,
    ) -> ChannelResult<Arc<Self>> {
        let channel = Self::new(config);
        channel.bind(underlay, bind_handler).await?;
        Ok(channel)
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn options(&self) -> &MultiChannelOptions {
        &self.options
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().members.is_empty()
    }

    /// Members in bind order.
    pub fn underlays(&self) -> Vec<Arc<dyn Underlay>> {
        self.inner
            .lock()
            .members
            .iter()
            .map(|m| m.underlay.clone())
            .collect()
    }

    /// Takes the inbound stream of messages that have no dedicated receive handler.
    /// Only the first caller gets the receiver.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound_rx.lock().take()
    }

    /// Registers a callback run exactly once when the channel reaches `Closed`.
    /// Runs immediately if the channel is already closed.
    pub fn on_teardown(&self, handler: impl FnOnce(&MultiChannel) + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Closed {
            drop(inner);
            handler(self);
        } else {
            inner.teardown.push(Box::new(handler));
        }
    }

    #[cfg(test)]
    pub(crate) fn teardown_len(&self) -> usize {
        self.inner.lock().teardown.len()
    }

    /// Attaches `underlay`, running `bind_handler` exactly once for it.
    ///
    /// A failing chain leaves the channel untouched; the caller owns closing the underlay.
    pub async fn bind(
        self: &Arc<Self>,
        underlay: Arc<dyn Underlay>,
        bind_handler: &dyn BindHandler,
    ) -> ChannelResult<()> {
        let _membership = self.membership.lock().await;
        {
            let inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return Err(ChannelError::Closed(self.logical_name.clone()));
            }
            if inner
                .members
                .iter()
                .any(|m| same_underlay(&m.underlay, &underlay))
            {
                return Err(ChannelError::AlreadyBound(underlay.label()));
            }
        }

        let mut binding = Binding::new(self, underlay.clone());
        if let Err(err) = bind_handler.bind_channel(&mut binding) {
            tracing::warn!(
                channel = %self.logical_name,
                underlay = %underlay.label(),
                error = %err,
                "Bind handler chain failed"
            );
            return Err(err);
        }
        let close_handlers = std::mem::take(&mut binding.close_handlers);
        let receive_handlers = std::mem::take(&mut binding.receive_handlers);
        drop(binding);

        self.receive_handlers.write().extend(receive_handlers);
        let (previous, members) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.members.push(Member {
                underlay: underlay.clone(),
                close_handlers,
            });
            inner.state = ChannelState::Bound;
            (previous, inner.members.len())
        };

        match previous {
            ChannelState::Unbound => tracing::info!(
                channel = %self.logical_name,
                underlay = %underlay.label(),
                "Channel bound"
            ),
            ChannelState::Draining => tracing::info!(
                channel = %self.logical_name,
                underlay = %underlay.label(),
                "Channel rebound within grace window"
            ),
            _ => tracing::debug!(
                channel = %self.logical_name,
                underlay = %underlay.label(),
                members,
                "Underlay added to channel"
            ),
        }
        self.underlay_handler.handle_underlay_bound(self, &underlay);
        Ok(())
    }

    /// Transport notification that a member underlay went away.
    ///
    /// Close handlers of the member run exactly once; repeated notifications are ignored.
    pub async fn underlay_closed(self: &Arc<Self>, underlay: &Arc<dyn Underlay>) {
        let _membership = self.membership.lock().await;
        let (member, drain_epoch) = {
            let mut inner = self.inner.lock();
            let Some(pos) = inner
                .members
                .iter()
                .position(|m| same_underlay(&m.underlay, underlay))
            else {
                tracing::debug!(
                    channel = %self.logical_name,
                    underlay = %underlay.label(),
                    "Close notification for underlay which is not a member"
                );
                return;
            };
            let member = inner.members.remove(pos);
            let drain_epoch = if inner.members.is_empty() && inner.state == ChannelState::Bound {
                inner.state = ChannelState::Draining;
                inner.drain_epoch += 1;
                Some(inner.drain_epoch)
            } else {
                None
            };
            (member, drain_epoch)
        };

        for handler in &member.close_handlers {
            handler.handle_close(self, &member.underlay);
        }
        self.underlay_handler
            .handle_underlay_closed(self, &member.underlay);

        if let Some(epoch) = drain_epoch {
            tracing::info!(
                channel = %self.logical_name,
                grace_window_ms = self.options.grace_window.as_millis() as u64,
                "Last underlay closed, channel draining"
            );
            self.schedule_expiry(epoch);
        }
    }

    fn schedule_expiry(self: &Arc<Self>, epoch: u64) {
        let grace_window = self.options.grace_window;
        let channel: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace_window).await;
            if let Some(channel) = channel.upgrade() {
                channel.expire_drain(epoch).await;
            }
        });
    }

    async fn expire_drain(&self, epoch: u64) {
        let _membership = self.membership.lock().await;
        let teardown = {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Draining || inner.drain_epoch != epoch {
                return;
            }
            inner.state = ChannelState::Closed;
            std::mem::take(&mut inner.teardown)
        };
        tracing::info!(
            channel = %self.logical_name,
            "Grace window elapsed without rebind, channel closed"
        );
        for handler in teardown {
            handler(self);
        }
    }

    /// Closes every member and tears the channel down. Idempotent.
    pub async fn close(&self) {
        let _membership = self.membership.lock().await;
        self.close_locked();
    }

    /// Closes the channel only if no member ever completed a bind.
    pub(crate) async fn close_if_unbound(&self) -> bool {
        let _membership = self.membership.lock().await;
        if self.inner.lock().state != ChannelState::Unbound {
            return false;
        }
        self.close_locked();
        true
    }

    fn close_locked(&self) {
        let (members, teardown) = {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Closed;
            (
                std::mem::take(&mut inner.members),
                std::mem::take(&mut inner.teardown),
            )
        };
        tracing::debug!(
            channel = %self.logical_name,
            members = members.len(),
            "Closing channel"
        );
        for member in members {
            member.underlay.close();
            for handler in &member.close_handlers {
                handler.handle_close(self, &member.underlay);
            }
            self.underlay_handler
                .handle_underlay_closed(self, &member.underlay);
        }
        for handler in teardown {
            handler(self);
        }
    }

    /// Sends over the next member in round-robin order, falling through to the
    /// remaining members when a send fails.
    pub fn send(&self, msg: &Message) -> ChannelResult<()> {
        let underlays = {
            let inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return Err(ChannelError::Closed(self.logical_name.clone()));
            }
            inner
                .members
                .iter()
                .map(|m| m.underlay.clone())
                .collect::<Vec<_>>()
        };
        if underlays.is_empty() {
            return Err(ChannelError::NoUnderlays(self.logical_name.clone()));
        }

        let start = self.next_member.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for offset in 0..underlays.len() {
            let underlay = &underlays[(start + offset) % underlays.len()];
            match underlay.send(msg) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        channel = %self.logical_name,
                        underlay = %underlay.label(),
                        error = %err,
                        "Send failed, trying next underlay"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ChannelError::NoUnderlays(self.logical_name.clone())))
    }

    /// Entry point for messages read by the transport from member `from`.
    pub async fn dispatch(&self, from: &Arc<dyn Underlay>, msg: Message) -> ChannelResult<()> {
        {
            let inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return Err(ChannelError::Closed(self.logical_name.clone()));
            }
            if !inner.members.iter().any(|m| same_underlay(&m.underlay, from)) {
                return Err(ChannelError::UnknownUnderlay(from.label()));
            }
        }
        let handler = self.receive_handlers.read().get(&msg.content_type).cloned();
        match handler {
            Some(handler) => {
                handler.handle_receive(msg, self);
                Ok(())
            }
            None => self
                .inbound_tx
                .send(msg)
                .await
                .map_err(|_| ChannelError::InboundClosed),
        }
    }
}

impl fmt::Debug for MultiChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MultiChannel")
            .field("logical_name", &self.logical_name)
            .field("state", &inner.state)
            .field("members", &inner.members.len())
            .finish()
    }
}
