//! Management records for routers and the in-memory store applying them.
//!
//! Only the control-channel listener field carries real semantics here: on create it
//! may be omitted (stored empty), on patch an omitted field leaves the stored mapping
//! alone while any submitted mapping, `{}` included, replaces it entirely.

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

use crate::config::{CtrlChanListeners, ListenerConfigError, RawCtrlChanListeners};

#[derive(Debug, thiserror::Error)]
pub enum ManagementError {
    #[error("router {0} not found")]
    NotFound(String),
    #[error("router {0} already exists")]
    AlreadyExists(String),
    #[error("router id must not be empty")]
    InvalidId,
    #[error("invalid ctrlChanListeners for router {id}: {source}")]
    InvalidListeners {
        id: String,
        #[source]
        source: ListenerConfigError,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCreate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctrl_chan_listeners: Option<RawCtrlChanListeners>,
}

/// Partial update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctrl_chan_listeners: Option<RawCtrlChanListeners>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterDetail {
    pub id: String,
    pub name: String,
    /// Always present; an empty object when the router has no listeners.
    pub ctrl_chan_listeners: CtrlChanListeners,
    /// Incremented by every applied patch.
    pub revision: u64,
}

#[derive(Debug, Clone)]
struct RouterRecord {
    name: String,
    ctrl_chan_listeners: CtrlChanListeners,
    revision: u64,
}

impl RouterRecord {
    fn detail(&self, id: &str) -> RouterDetail {
        RouterDetail {
            id: id.to_owned(),
            name: self.name.clone(),
            ctrl_chan_listeners: self.ctrl_chan_listeners.clone(),
            revision: self.revision,
        }
    }
}

#[derive(Default)]
pub struct RouterStore {
    routers: DashMap<String, RouterRecord>,
}

impl RouterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, create: RouterCreate) -> Result<RouterDetail, ManagementError> {
        let id = create.id.trim().to_owned();
        if id.is_empty() {
            return Err(ManagementError::InvalidId);
        }
        let listeners = match create.ctrl_chan_listeners {
            Some(raw) => CtrlChanListeners::try_from(raw).map_err(|source| {
                ManagementError::InvalidListeners {
                    id: id.clone(),
                    source,
                }
            })?,
            None => CtrlChanListeners::default(),
        };

        match self.routers.entry(id.clone()) {
            Entry::Occupied(_) => Err(ManagementError::AlreadyExists(id)),
            Entry::Vacant(vac) => {
                let record = vac.insert(RouterRecord {
                    name: create.name,
                    ctrl_chan_listeners: listeners,
                    revision: 0,
                });
                tracing::info!(
                    router_id = %id,
                    listeners = record.ctrl_chan_listeners.len(),
                    "Router created"
                );
                Ok(record.detail(&id))
            }
        }
    }

    pub fn detail(&self, id: &str) -> Result<RouterDetail, ManagementError> {
        self.routers
            .get(id)
            .map(|record| record.detail(id))
            .ok_or_else(|| ManagementError::NotFound(id.to_owned()))
    }

    /// All routers ordered by id.
    pub fn list(&self) -> Vec<RouterDetail> {
        let mut routers: Vec<_> = self
            .routers
            .iter()
            .map(|entry| entry.value().detail(entry.key()))
            .collect();
        routers.sort_by(|a, b| a.id.cmp(&b.id));
        routers
    }

    /// Applies `patch`. Nothing is changed when any field fails validation.
    pub fn patch(&self, id: &str, patch: RouterPatch) -> Result<RouterDetail, ManagementError> {
        let mut record = self
            .routers
            .get_mut(id)
            .ok_or_else(|| ManagementError::NotFound(id.to_owned()))?;

        let mut listeners = record.ctrl_chan_listeners.clone();
        let diff = listeners
            .apply_patch(patch.ctrl_chan_listeners)
            .map_err(|source| ManagementError::InvalidListeners {
                id: id.to_owned(),
                source,
            })?;

        if let Some(diff) = diff.filter(|diff| !diff.is_empty()) {
            tracing::info!(
                router_id = %id,
                added = ?diff.added,
                removed = ?diff.removed,
                regrouped = ?diff.regrouped,
                "Ctrl channel listeners updated"
            );
        }
        record.ctrl_chan_listeners = listeners;
        if let Some(name) = patch.name {
            record.name = name;
        }
        record.revision += 1;
        Ok(record.detail(id))
    }

    pub fn delete(&self, id: &str) -> Result<RouterDetail, ManagementError> {
        let (id, record) = self
            .routers
            .remove(id)
            .ok_or_else(|| ManagementError::NotFound(id.to_owned()))?;
        tracing::info!(router_id = %id, "Router deleted");
        Ok(record.detail(&id))
    }
}
