//! Common test utilities shared across integration tests.
//!
//! These utilities are shared across tests and may not all be used in every test file.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use fabric_router::{config::RouterConfig, Router};

pub const PEER_ADDR: &str = "10.0.0.1:6262";
pub const GRACE_WINDOW: Duration = Duration::from_millis(500);

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}

pub fn test_config() -> RouterConfig {
    let mut config = RouterConfig::new("router-a");
    config.ctrl.grace_window_ms = GRACE_WINDOW.as_millis() as u64;
    config.ctrl.reconnect_queue_len = 256;
    config
}

pub fn test_router() -> Arc<Router> {
    Router::new(test_config())
}

/// Counts invocations of a callback handed to the code under test.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn callback(&self) -> impl FnOnce() + Send + 'static {
        let count = self.0.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
