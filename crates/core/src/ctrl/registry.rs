use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;

use super::CtrlChannelError;
use crate::channel::{Binding, ChannelState, MultiChannel};

/// Snapshot of one registered control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CtrlChannelStatus {
    pub address: String,
    pub logical_name: String,
    pub state: ChannelState,
    pub members: usize,
}

/// Router-wide map of peer address to logical control channel.
///
/// Channels stay registered while `Draining` so a rebind within the grace window finds
/// them; they are removed once closed.
#[derive(Default)]
pub struct CtrlChannels {
    channels: DashMap<String, Arc<MultiChannel>>,
    /// Controller id to peer address, filled in as underlays are accepted.
    ctrl_ids: DashMap<String, String>,
}

impl CtrlChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel registered for `address`, creating it with `create` when
    /// absent. The lookup and insert happen under a single entry lock, so concurrent
    /// first binds for one address always share one channel.
    ///
    /// The flag is `true` when this call created the channel.
    pub fn find_or_create<F>(&self, address: &str, create: F) -> (Arc<MultiChannel>, bool)
    where
        F: FnOnce() -> Arc<MultiChannel>,
    {
        match self.channels.entry(address.to_owned()) {
            Entry::Occupied(mut occ) => {
                if occ.get().state() == ChannelState::Closed {
                    // closed but its teardown has not removed it yet
                    let channel = create();
                    occ.insert(channel.clone());
                    (channel, true)
                } else {
                    (occ.get().clone(), false)
                }
            }
            Entry::Vacant(vac) => {
                let channel = create();
                vac.insert(channel.clone());
                (channel, true)
            }
        }
    }

    /// Records an underlay bound into the channel registered for `address`.
    pub fn accept_ctrl_channel(
        &self,
        address: &str,
        binding: &Binding<'_>,
    ) -> Result<(), CtrlChannelError> {
        let registered = self
            .channels
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CtrlChannelError::NotRegistered {
                address: address.to_owned(),
            })?;
        if !Arc::ptr_eq(&registered, binding.channel()) {
            return Err(CtrlChannelError::Replaced {
                address: address.to_owned(),
            });
        }

        let ctrl_id = binding.underlay().id().to_owned();
        tracing::debug!(
            %address,
            %ctrl_id,
            channel = %registered.logical_name(),
            "Accepted ctrl channel underlay"
        );
        self.ctrl_ids.insert(ctrl_id, address.to_owned());
        Ok(())
    }

    /// Drops the controller id of an underlay that left `channel`.
    ///
    /// The id is kept while another member of `channel` still uses it, and left alone
    /// when it now belongs to a channel that replaced `channel` under `address`.
    pub fn forget_ctrl_id(&self, ctrl_id: &str, address: &str, channel: &MultiChannel) -> bool {
        let replaced = self
            .channels
            .get(address)
            .is_some_and(|registered| !std::ptr::eq(Arc::as_ptr(registered.value()), channel));
        if replaced || channel.underlays().iter().any(|u| u.id() == ctrl_id) {
            return false;
        }
        let removed = self
            .ctrl_ids
            .remove_if(ctrl_id, |_, registered| registered == address)
            .is_some();
        if removed {
            tracing::debug!(%address, %ctrl_id, "Ctrl id forgotten");
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<Arc<MultiChannel>> {
        self.channels.get(address).map(|entry| entry.value().clone())
    }

    pub fn get_by_ctrl_id(&self, ctrl_id: &str) -> Option<Arc<MultiChannel>> {
        let address = self.ctrl_ids.get(ctrl_id)?.value().clone();
        self.get(&address)
    }

    /// Removes the entry for `address` if it still points at `channel`.
    pub fn remove_if_same(&self, address: &str, channel: &MultiChannel) -> bool {
        let removed = self
            .channels
            .remove_if(address, |_, registered| {
                std::ptr::eq(Arc::as_ptr(registered), channel)
            })
            .is_some();
        if removed {
            self.ctrl_ids.retain(|_, addr| addr != address);
            tracing::debug!(%address, channel = %channel.logical_name(), "Ctrl channel unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Number of controller ids currently resolvable.
    pub fn ctrl_id_count(&self) -> usize {
        self.ctrl_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn status(&self) -> Vec<CtrlChannelStatus> {
        let mut status: Vec<_> = self
            .channels
            .iter()
            .map(|entry| CtrlChannelStatus {
                address: entry.key().clone(),
                logical_name: entry.value().logical_name().to_owned(),
                state: entry.value().state(),
                members: entry.value().member_count(),
            })
            .collect();
        status.sort_by(|a, b| a.address.cmp(&b.address));
        status
    }

    /// Closes every registered channel.
    pub async fn close_all(&self) {
        let channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(channels.iter().map(|channel| channel.close())).await;
    }
}
