//! Bonding of inbound control channel underlays into one logical channel per peer.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{addr, test_router, CallCounter, GRACE_WINDOW, PEER_ADDR};
use fabric_router::{
    channel::{
        mem::MemUnderlay, BindHandlerFn, Binding, ChannelError, ChannelResult, ChannelState,
        Message, ReceiveHandlerFn, Underlay,
    },
    ctrl::CtrlChannelError,
    Router,
};
use futures::future::join_all;
use testresult::TestResult;

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_first_binds_share_one_channel() -> TestResult {
    const N: usize = 16;
    let router = test_router();
    let acceptor = Arc::new(router.ctrl_acceptor());
    let mut reconnects = router.subscribe_reconnects();

    let handles = (0..N).map(|i| {
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let underlay = MemUnderlay::new(format!("c{i}"), addr(PEER_ADDR));
            acceptor.handle_grouped_underlay(underlay, || {}).await
        })
    });
    let channels: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("accept task panicked").expect("bind failed"))
        .collect();

    let first = &channels[0];
    assert!(channels.iter().all(|c| Arc::ptr_eq(c, first)));
    assert_eq!(router.ctrls().len(), 1);
    assert_eq!(first.member_count(), N);
    assert_eq!(first.state(), ChannelState::Bound);

    let mut events = 0;
    while reconnects.try_recv().is_ok() {
        events += 1;
    }
    assert_eq!(events, N, "one reconnect notification per bind");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn every_bind_notifies_reconnect_once() -> TestResult {
    let router = test_router();
    let acceptor = router.ctrl_acceptor();
    let mut reconnects = router.subscribe_reconnects();

    for (i, expected_members) in (1..=3).enumerate() {
        acceptor
            .accept_underlay(MemUnderlay::new(format!("c{i}"), addr(PEER_ADDR)))
            .await?;
        let event = reconnects.try_recv()?;
        assert_eq!(event.address, PEER_ADDR);
        assert_eq!(event.logical_name, "ctrl/c0");
        assert_eq!(event.members, expected_members);
        assert!(reconnects.try_recv().is_err());
    }
    Ok(())
}

#[test_log::test(tokio::test(start_paused = true))]
async fn channel_survives_member_churn_within_grace_window() -> TestResult {
    let router = test_router();
    let acceptor = router.ctrl_acceptor();
    let fully_closed = CallCounter::default();

    let a: Arc<dyn Underlay> = MemUnderlay::new("a", addr(PEER_ADDR));
    let b: Arc<dyn Underlay> = MemUnderlay::new("b", addr(PEER_ADDR));
    let channel = acceptor
        .handle_grouped_underlay(a.clone(), fully_closed.callback())
        .await?;
    acceptor.accept_underlay(b.clone()).await?;
    assert_eq!(channel.member_count(), 2);

    channel.underlay_closed(&a).await;
    assert_eq!(channel.state(), ChannelState::Bound);

    channel.underlay_closed(&b).await;
    assert_eq!(channel.state(), ChannelState::Draining);
    let status = router.ctrls().status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, ChannelState::Draining);

    tokio::time::sleep(GRACE_WINDOW / 2).await;
    let c: Arc<dyn Underlay> = MemUnderlay::new("c", addr(PEER_ADDR));
    let rebound = acceptor.handle_grouped_underlay(c.clone(), || {}).await?;
    assert!(Arc::ptr_eq(&channel, &rebound));
    assert_eq!(channel.state(), ChannelState::Bound);

    tokio::time::sleep(GRACE_WINDOW * 2).await;
    assert_eq!(channel.state(), ChannelState::Bound);
    assert_eq!(fully_closed.get(), 0);

    channel.underlay_closed(&c).await;
    tokio::time::sleep(GRACE_WINDOW + Duration::from_millis(10)).await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(fully_closed.get(), 1);
    assert!(router.ctrls().get(PEER_ADDR).is_none());

    tokio::time::sleep(GRACE_WINDOW * 2).await;
    assert_eq!(fully_closed.get(), 1);
    Ok(())
}

#[test_log::test(tokio::test(start_paused = true))]
async fn reconnect_after_teardown_opens_fresh_channel() -> TestResult {
    let router = test_router();
    let acceptor = router.ctrl_acceptor();

    let a: Arc<dyn Underlay> = MemUnderlay::new("a", addr(PEER_ADDR));
    let old = acceptor.handle_grouped_underlay(a.clone(), || {}).await?;
    old.underlay_closed(&a).await;
    tokio::time::sleep(GRACE_WINDOW * 2).await;
    assert_eq!(old.state(), ChannelState::Closed);

    let fresh = acceptor
        .handle_grouped_underlay(MemUnderlay::new("b", addr(PEER_ADDR)), || {})
        .await?;
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert_eq!(fresh.logical_name(), "ctrl/b");
    assert_eq!(router.ctrls().len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn ctrl_bind_handler_installs_message_handling() -> TestResult {
    const PING: u32 = 10;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let install = BindHandlerFn(move |binding: &mut Binding<'_>| -> ChannelResult<()> {
        let sink = sink.clone();
        binding.add_receive_handler(
            PING,
            ReceiveHandlerFn(move |msg: Message, _: &fabric_router::channel::MultiChannel| {
                sink.lock().unwrap().push(msg.body);
            }),
        );
        Ok(())
    });
    let router = Router::with_ctrl_bind_handler(common::test_config(), Arc::new(install));
    let acceptor = router.ctrl_acceptor();

    let a = MemUnderlay::new("a", addr(PEER_ADDR));
    let b = MemUnderlay::new("b", addr(PEER_ADDR));
    let a_dyn: Arc<dyn Underlay> = a.clone();
    let channel = acceptor.handle_grouped_underlay(a_dyn.clone(), || {}).await?;
    acceptor.accept_underlay(b.clone()).await?;

    channel.dispatch(&a_dyn, Message::new(PING, "ping")).await?;
    channel.dispatch(&a_dyn, Message::new(20, "other")).await?;
    assert_eq!(received.lock().unwrap().len(), 1);
    let mut inbound = channel.take_inbound().expect("inbound stream");
    assert_eq!(inbound.recv().await.map(|m| m.content_type), Some(20));

    channel.send(&Message::new(1, "x"))?;
    channel.send(&Message::new(1, "y"))?;
    assert_eq!(a.sent().len(), 1);
    assert_eq!(b.sent().len(), 1);

    a.set_fail_sends(true);
    channel.send(&Message::new(1, "z"))?;
    channel.send(&Message::new(1, "w"))?;
    assert_eq!(b.sent().len(), 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rejected_underlay_leaves_bonded_channel_untouched() -> TestResult {
    let reject_c = BindHandlerFn(|binding: &mut Binding<'_>| -> ChannelResult<()> {
        if binding.underlay().id() == "c" {
            return Err(ChannelError::BindFailed("handshake rejected".into()));
        }
        Ok(())
    });
    let router = Router::with_ctrl_bind_handler(common::test_config(), Arc::new(reject_c));
    let acceptor = router.ctrl_acceptor();
    let mut reconnects = router.subscribe_reconnects();

    let channel = acceptor
        .handle_grouped_underlay(MemUnderlay::new("a", addr(PEER_ADDR)), || {})
        .await?;
    acceptor
        .accept_underlay(MemUnderlay::new("b", addr(PEER_ADDR)))
        .await?;
    let err = acceptor
        .accept_underlay(MemUnderlay::new("c", addr(PEER_ADDR)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CtrlChannelError::Channel(ChannelError::BindFailed(_))
    ));

    assert_eq!(channel.state(), ChannelState::Bound);
    assert_eq!(channel.member_count(), 2);
    assert_eq!(router.ctrls().len(), 1);
    let registered = router.ctrls().get(PEER_ADDR).expect("still registered");
    assert!(Arc::ptr_eq(&registered, &channel));
    assert!(router.ctrls().get_by_ctrl_id("c").is_none());
    assert!(router.ctrls().get_by_ctrl_id("b").is_some());

    let mut events = 0;
    while reconnects.try_recv().is_ok() {
        events += 1;
    }
    assert_eq!(events, 2);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn bind_racing_teardown_resolves_fresh_channel() -> TestResult {
    let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    // holds the membership lock of the channel while "slow" binds
    let hold = BindHandlerFn(move |binding: &mut Binding<'_>| -> ChannelResult<()> {
        if binding.underlay().id() == "slow" {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
        }
        Ok(())
    });
    let router = Router::with_ctrl_bind_handler(common::test_config(), Arc::new(hold));
    let acceptor = Arc::new(router.ctrl_acceptor());

    let original = acceptor
        .handle_grouped_underlay(MemUnderlay::new("first", addr(PEER_ADDR)), || {})
        .await?;

    let slow = tokio::spawn({
        let acceptor = acceptor.clone();
        async move {
            acceptor
                .accept_underlay(MemUnderlay::new("slow", addr(PEER_ADDR)))
                .await
        }
    });
    tokio::task::spawn_blocking(move || entered_rx.recv()).await??;

    // queued on the membership lock ahead of the late bind
    let closing = tokio::spawn({
        let channel = original.clone();
        async move { channel.close().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    // resolves the still-bound original channel, then waits behind the close
    let late = tokio::spawn({
        let acceptor = acceptor.clone();
        async move {
            acceptor
                .handle_grouped_underlay(MemUnderlay::new("late", addr(PEER_ADDR)), || {})
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    release_tx.send(())?;

    slow.await??;
    closing.await?;
    let fresh = late.await??;

    assert_eq!(original.state(), ChannelState::Closed);
    assert!(!Arc::ptr_eq(&original, &fresh));
    assert_eq!(fresh.state(), ChannelState::Bound);
    assert_eq!(fresh.logical_name(), "ctrl/late");
    assert_eq!(router.ctrls().len(), 1);
    let registered = router.ctrls().get(PEER_ADDR).expect("fresh channel registered");
    assert!(Arc::ptr_eq(&registered, &fresh));
    assert!(router.ctrls().get_by_ctrl_id("first").is_none());
    Ok(())
}
