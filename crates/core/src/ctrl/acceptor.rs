use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use super::CtrlChannelError;
use crate::{
    channel::{
        BindHandlerFn, BindHandlers, Binding, ChannelError, ChannelState, CloseHandlerFn,
        MultiChannel,
        MultiChannelConfig, MultiChannelOptions, Underlay, UnderlayHandler,
    },
    router::Router,
};

/// A bind racing with the teardown of the channel it resolved re-resolves the address
/// at most this many times.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Underlay handler shared by every control channel of a router.
#[derive(Default)]
pub struct CtrlUnderlayHandler {
    bound: AtomicU64,
    closed: AtomicU64,
}

impl CtrlUnderlayHandler {
    pub fn bound_total(&self) -> u64 {
        self.bound.load(Ordering::Acquire)
    }

    pub fn closed_total(&self) -> u64 {
        self.closed.load(Ordering::Acquire)
    }
}

impl UnderlayHandler for CtrlUnderlayHandler {
    fn handle_underlay_bound(&self, channel: &MultiChannel, underlay: &Arc<dyn Underlay>) {
        self.bound.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            channel = %channel.logical_name(),
            underlay = %underlay.label(),
            members = channel.member_count(),
            "Ctrl underlay bound"
        );
    }

    fn handle_underlay_closed(&self, channel: &MultiChannel, underlay: &Arc<dyn Underlay>) {
        self.closed.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            channel = %channel.logical_name(),
            underlay = %underlay.label(),
            members = channel.member_count(),
            "Ctrl underlay closed"
        );
    }
}

/// Accepts inbound control channel underlays and bonds them per peer.
pub struct CtrlChannelAcceptor {
    router: Arc<Router>,
    options: MultiChannelOptions,
    underlay_handler: Arc<CtrlUnderlayHandler>,
}

impl CtrlChannelAcceptor {
    pub(crate) fn new(router: Arc<Router>, options: MultiChannelOptions) -> Self {
        Self {
            router,
            options,
            underlay_handler: Arc::new(CtrlUnderlayHandler::default()),
        }
    }

    pub fn underlay_handler(&self) -> &Arc<CtrlUnderlayHandler> {
        &self.underlay_handler
    }

    /// Binds `underlay` into the logical control channel of its peer, creating the
    /// channel if this is the first underlay.
    ///
    /// `on_fully_closed` runs once the logical channel (not just this underlay) has been
    /// torn down. A failure only affects this underlay; the caller closes it.
    pub async fn handle_grouped_underlay<F>(
        &self,
        underlay: Arc<dyn Underlay>,
        on_fully_closed: F,
    ) -> Result<Arc<MultiChannel>, CtrlChannelError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.bind_underlay(underlay, Some(on_fully_closed)).await
    }

    /// Accepts an underlay for callers that don't care about the logical channel closing.
    pub async fn accept_underlay(&self, underlay: Arc<dyn Underlay>) -> Result<(), CtrlChannelError> {
        self.bind_underlay::<fn()>(underlay, None).await.map(|_| ())
    }

    async fn bind_underlay<F>(
        &self,
        underlay: Arc<dyn Underlay>,
        on_fully_closed: Option<F>,
    ) -> Result<Arc<MultiChannel>, CtrlChannelError>
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::info!(ctrl_id = %underlay.id(), "Accepting inbound ctrl channel connection");
        if self.router.is_shutting_down() {
            return Err(CtrlChannelError::ShuttingDown);
        }

        let address = channel_address(underlay.as_ref());
        let mut attempt = 0;
        let channel = loop {
            attempt += 1;
            let (channel, created) = self
                .router
                .ctrls()
                .find_or_create(&address, || self.new_channel(&address, underlay.as_ref()));
            let chain = self.bind_chain(&address);

            match channel.bind(underlay.clone(), &chain).await {
                Ok(()) => break channel,
                Err(ChannelError::Closed(_)) if !created && attempt < MAX_RESOLVE_ATTEMPTS => {
                    tracing::debug!(
                        %address,
                        channel = %channel.logical_name(),
                        "Ctrl channel closed while binding, resolving again"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        "Failure accepting ctrl channel {} with multi-underlay",
                        underlay.label()
                    );
                    // the registry may have recorded the id before a later handler failed
                    self.router
                        .ctrls()
                        .forget_ctrl_id(underlay.id(), &address, &channel);
                    if created && channel.close_if_unbound().await {
                        tracing::debug!(%address, "Rolled back ctrl channel registration");
                    }
                    return Err(err.into());
                }
            }
        };

        if let Some(on_fully_closed) = on_fully_closed {
            channel.on_teardown(move |_| on_fully_closed());
        }
        self.router.notify_of_reconnect(&address, &channel);
        Ok(channel)
    }

    fn new_channel(&self, address: &str, underlay: &dyn Underlay) -> Arc<MultiChannel> {
        let channel = MultiChannel::new(MultiChannelConfig {
            logical_name: format!("ctrl/{}", underlay.id()),
            options: self.options.clone(),
            underlay_handler: self.underlay_handler.clone(),
        });
        let router: Weak<Router> = Arc::downgrade(&self.router);
        let address = address.to_owned();
        channel.on_teardown(move |channel| {
            if let Some(router) = router.upgrade() {
                router.ctrls().remove_if_same(&address, channel);
            }
        });
        channel
    }

    fn bind_chain(&self, address: &str) -> BindHandlers {
        let router = self.router.clone();
        let address = address.to_owned();
        let accept = BindHandlerFn(move |binding: &mut Binding<'_>| {
            let closed_address = address.clone();
            let registry_owner: Weak<Router> = Arc::downgrade(&router);
            binding.add_close_handler(CloseHandlerFn(
                move |channel: &MultiChannel, underlay: &Arc<dyn Underlay>| {
                    if let Some(router) = registry_owner.upgrade() {
                        router
                            .ctrls()
                            .forget_ctrl_id(underlay.id(), &closed_address, channel);
                    }
                    if channel.is_empty() && channel.state() == ChannelState::Draining {
                        tracing::info!(
                            address = %closed_address,
                            channel = %channel.logical_name(),
                            underlay = %underlay.label(),
                            "Last ctrl underlay closed, waiting for reconnect"
                        );
                    }
                },
            ));
            router
                .ctrls()
                .accept_ctrl_channel(&address, binding)
                .map_err(|err| ChannelError::BindFailed(err.to_string()))
        });
        BindHandlers::new(vec![Arc::new(accept), self.router.ctrl_bind_handler()])
    }
}

/// Key under which an underlay is bonded: its announced group, or its remote address.
fn channel_address(underlay: &dyn Underlay) -> String {
    match underlay.group() {
        Some(group) => group.to_owned(),
        None => underlay.remote_addr().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use super::*;
    use crate::{channel::mem::MemUnderlay, config::RouterConfig};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn router_with_grace(grace_window_ms: u64) -> Arc<Router> {
        let mut config = RouterConfig::new("router-a");
        config.ctrl.grace_window_ms = grace_window_ms;
        Router::new(config)
    }

    #[tokio::test]
    async fn underlays_from_one_peer_share_a_channel() -> testresult::TestResult {
        let router = router_with_grace(1_000);
        let acceptor = router.ctrl_acceptor();

        let first = acceptor
            .handle_grouped_underlay(MemUnderlay::new("c1", addr("10.0.0.1:6262")), || {})
            .await?;
        let second = acceptor
            .handle_grouped_underlay(MemUnderlay::new("c2", addr("10.0.0.1:6262")), || {})
            .await?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.logical_name(), "ctrl/c1");
        assert_eq!(first.member_count(), 2);
        assert_eq!(router.ctrls().len(), 1);
        assert!(router.ctrls().get_by_ctrl_id("c2").is_some());
        assert_eq!(acceptor.underlay_handler().bound_total(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn group_overrides_remote_address() -> testresult::TestResult {
        let router = router_with_grace(1_000);
        let acceptor = router.ctrl_acceptor();
        acceptor
            .accept_underlay(MemUnderlay::with_group("c1", addr("10.0.0.1:1"), "ctrl-a"))
            .await?;
        acceptor
            .accept_underlay(MemUnderlay::with_group("c2", addr("10.0.0.2:2"), "ctrl-a"))
            .await?;
        let channel = router.ctrls().get("ctrl-a").expect("registered under group");
        assert_eq!(channel.member_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_first_bind_is_rolled_back() -> testresult::TestResult {
        let reject = BindHandlerFn(|_: &mut Binding<'_>| -> crate::channel::ChannelResult<()> {
            Err(ChannelError::BindFailed("handshake rejected".into()))
        });
        let router =
            Router::with_ctrl_bind_handler(RouterConfig::new("router-a"), Arc::new(reject));
        let acceptor = router.ctrl_acceptor();
        let mut reconnects = router.subscribe_reconnects();

        let err = acceptor
            .accept_underlay(MemUnderlay::new("c1", addr("10.0.0.1:6262")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CtrlChannelError::Channel(ChannelError::BindFailed(_))
        ));
        assert!(router.ctrls().is_empty());
        assert!(reconnects.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fully_closed_callback_waits_for_grace_window() -> testresult::TestResult {
        let router = router_with_grace(500);
        let acceptor = router.ctrl_acceptor();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let underlay: Arc<dyn Underlay> = MemUnderlay::new("c1", addr("10.0.0.1:6262"));
        let channel = acceptor
            .handle_grouped_underlay(underlay.clone(), move || {
                let _ = tx.send(());
            })
            .await?;

        channel.underlay_closed(&underlay).await;
        assert_eq!(channel.state(), ChannelState::Draining);
        assert_eq!(router.ctrls().len(), 1);
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(router.ctrls().is_empty());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn closed_member_no_longer_resolves_by_ctrl_id() -> testresult::TestResult {
        let router = router_with_grace(1_000);
        let acceptor = router.ctrl_acceptor();

        let a: Arc<dyn Underlay> = MemUnderlay::new("a", addr("10.0.0.1:6262"));
        let channel = acceptor.handle_grouped_underlay(a.clone(), || {}).await?;
        acceptor
            .accept_underlay(MemUnderlay::new("b", addr("10.0.0.1:6262")))
            .await?;
        assert_eq!(channel.options().grace_window, Duration::from_millis(1_000));

        channel.underlay_closed(&a).await;
        assert_eq!(channel.state(), ChannelState::Bound);
        assert!(router.ctrls().get_by_ctrl_id("a").is_none());
        let by_b = router.ctrls().get_by_ctrl_id("b").expect("b still bound");
        assert!(Arc::ptr_eq(&by_b, &channel));
        assert_eq!(acceptor.underlay_handler().closed_total(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn member_churn_keeps_ctrl_ids_bounded() -> testresult::TestResult {
        let router = router_with_grace(1_000);
        let acceptor = router.ctrl_acceptor();
        let anchor: Arc<dyn Underlay> = MemUnderlay::new("anchor", addr("10.0.0.1:6262"));
        let channel = acceptor.handle_grouped_underlay(anchor, || {}).await?;

        for i in 0..200 {
            let underlay: Arc<dyn Underlay> =
                MemUnderlay::new(format!("churn-{i}"), addr("10.0.0.1:6262"));
            acceptor.accept_underlay(underlay.clone()).await?;
            channel.underlay_closed(&underlay).await;
        }

        assert_eq!(channel.member_count(), 1);
        assert_eq!(router.ctrls().ctrl_id_count(), 1);
        assert!(router.ctrls().get_by_ctrl_id("churn-199").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn shared_ctrl_id_survives_until_last_member_closes() -> testresult::TestResult {
        let router = router_with_grace(1_000);
        let acceptor = router.ctrl_acceptor();
        let first: Arc<dyn Underlay> = MemUnderlay::new("ctrl", addr("10.0.0.1:1"));
        let second: Arc<dyn Underlay> = MemUnderlay::new("ctrl", addr("10.0.0.1:1"));
        let channel = acceptor.handle_grouped_underlay(first.clone(), || {}).await?;
        acceptor.accept_underlay(second.clone()).await?;

        channel.underlay_closed(&first).await;
        assert!(router.ctrls().get_by_ctrl_id("ctrl").is_some());
        channel.underlay_closed(&second).await;
        assert!(router.ctrls().get_by_ctrl_id("ctrl").is_none());
        assert_eq!(channel.underlays().len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn accept_underlay_registers_no_teardown_callback() -> testresult::TestResult {
        let router = router_with_grace(1_000);
        let acceptor = router.ctrl_acceptor();
        for i in 0..10 {
            acceptor
                .accept_underlay(MemUnderlay::new(format!("c{i}"), addr("10.0.0.1:6262")))
                .await?;
        }
        let channel = router.ctrls().get("10.0.0.1:6262").expect("registered");
        assert_eq!(channel.member_count(), 10);
        // only the registry removal installed by the acceptor itself
        assert_eq!(channel.teardown_len(), 1);

        acceptor
            .handle_grouped_underlay(MemUnderlay::new("c10", addr("10.0.0.1:6262")), || {})
            .await?;
        assert_eq!(channel.teardown_len(), 2);
        Ok(())
    }
}
