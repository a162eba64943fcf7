//! Router context: everything the control and data plane acceptors share.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    channel::{BindHandler, BindHandlers, MultiChannel},
    config::RouterConfig,
    ctrl::{CtrlChannelAcceptor, CtrlChannelStatus, CtrlChannels, ReconnectEvent, ReconnectNotifier},
    forwarder::Forwarder,
    xlink::XlinkAccepter,
};

/// Point-in-time view of a router.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub id: String,
    pub ctrl_channels: Vec<CtrlChannelStatus>,
    pub links: usize,
    pub shutting_down: bool,
}

/// Created once at startup and handed to every acceptor.
pub struct Router {
    config: RouterConfig,
    ctrls: CtrlChannels,
    forwarder: Arc<Forwarder>,
    reconnects: ReconnectNotifier,
    /// Installs message handling on every bound ctrl underlay.
    ctrl_bind_handler: Arc<dyn BindHandler>,
    shutting_down: AtomicBool,
}

impl Router {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        Self::with_ctrl_bind_handler(config, Arc::new(BindHandlers::default()))
    }

    pub fn with_ctrl_bind_handler(
        config: RouterConfig,
        ctrl_bind_handler: Arc<dyn BindHandler>,
    ) -> Arc<Self> {
        tracing::info!(
            router_id = %config.id,
            listeners = config.ctrl.listeners.len(),
            grace_window_ms = config.ctrl.grace_window_ms,
            "Starting router"
        );
        Arc::new(Self {
            forwarder: Arc::new(Forwarder::new(config.id.clone())),
            reconnects: ReconnectNotifier::new(config.ctrl.reconnect_queue_len),
            ctrls: CtrlChannels::new(),
            ctrl_bind_handler,
            shutting_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn ctrls(&self) -> &CtrlChannels {
        &self.ctrls
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn ctrl_bind_handler(&self) -> Arc<dyn BindHandler> {
        self.ctrl_bind_handler.clone()
    }

    pub fn subscribe_reconnects(&self) -> mpsc::Receiver<ReconnectEvent> {
        self.reconnects.subscribe()
    }

    pub fn notify_of_reconnect(&self, address: &str, channel: &MultiChannel) {
        self.reconnects.notify(ReconnectEvent {
            address: address.to_owned(),
            logical_name: channel.logical_name().to_owned(),
            members: channel.member_count(),
        });
    }

    pub fn ctrl_acceptor(self: &Arc<Self>) -> CtrlChannelAcceptor {
        CtrlChannelAcceptor::new(self.clone(), self.config.channel_options())
    }

    pub fn xlink_accepter(&self) -> XlinkAccepter {
        XlinkAccepter::new(self.forwarder.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            id: self.config.id.clone(),
            ctrl_channels: self.ctrls.status(),
            links: self.forwarder.link_count(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Stops accepting, closes every ctrl channel and link. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(router_id = %self.config.id, "Shutting down router");
        self.ctrls.close_all().await;
        self.forwarder.close_all();
        tracing::debug!(
            router_id = %self.config.id,
            remaining_ctrl_channels = self.ctrls.len(),
            "Router shut down"
        );
    }
}
