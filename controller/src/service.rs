use heating_common::{ConfigEntry, HeatingConfig, ScheduleLookupError, ScheduleSelector};
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{coordinator::CoordinatorHandle, store::AppStore};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no heating configuration entries are loaded")]
    NoEntries,

    #[error("configuration entry '{0}' was not found")]
    UnknownEntry(String),

    #[error("{0} configuration entries are loaded, entry_id is required")]
    AmbiguousEntry(usize),

    #[error(transparent)]
    Schedule(#[from] ScheduleLookupError),

    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEnabledRequest {
    #[serde(default)]
    pub entry_id: Option<String>,
    #[serde(flatten)]
    pub selector: ScheduleSelector,
    pub enabled: bool,
}

/// Running coordinators keyed by entry id, in load order.
pub struct Instances {
    entries: IndexMap<String, CoordinatorHandle>,
    changes: Mutex<()>,
}

impl Instances {
    pub fn new(handles: impl IntoIterator<Item = CoordinatorHandle>) -> Self {
        Self {
            entries: handles
                .into_iter()
                .map(|handle| (handle.entry_id.clone(), handle))
                .collect(),
            changes: Mutex::new(()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoordinatorHandle> {
        self.entries.values()
    }

    /// Without an entry id the request is only unambiguous when exactly one
    /// entry is loaded.
    pub fn resolve(&self, entry_id: Option<&str>) -> Result<&CoordinatorHandle, ServiceError> {
        match entry_id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .entries
                .get(id)
                .ok_or_else(|| ServiceError::UnknownEntry(id.to_string())),
            None => match self.entries.len() {
                0 => Err(ServiceError::NoEntries),
                1 => self.entries.values().next().ok_or(ServiceError::NoEntries),
                many => Err(ServiceError::AmbiguousEntry(many)),
            },
        }
    }

    /// Saves every entry with `candidate` standing in for `entry_id`'s live
    /// config, then makes the candidate live. Nothing changes in memory when
    /// the save fails.
    async fn commit(
        &self,
        store: &AppStore,
        handle: &CoordinatorHandle,
        candidate: HeatingConfig,
    ) -> Result<(), ServiceError> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for current in self.entries.values() {
            if current.entry_id == handle.entry_id {
                entries.push(ConfigEntry {
                    entry_id: current.entry_id.clone(),
                    title: current.title.clone(),
                    config: candidate.clone(),
                });
            } else {
                entries.push(current.to_entry().await);
            }
        }

        store.save_entries(&entries).await?;
        handle.update_config(|config| *config = candidate).await;
        handle.force_update_on_next_refresh();
        handle.request_refresh();
        Ok(())
    }
}

/// Enables or disables one schedule. Returns whether anything changed; a
/// change is persisted and forces the next cycle.
pub async fn set_schedule_enabled(
    instances: &Instances,
    store: &AppStore,
    request: &ScheduleEnabledRequest,
) -> Result<bool, ServiceError> {
    let handle = instances.resolve(request.entry_id.as_deref())?;
    let _changes = instances.changes.lock().await;
    let mut candidate = handle.config().await;
    let changed = candidate.set_schedule_enabled(&request.selector, request.enabled)?;

    let state = if request.enabled { "enabled" } else { "disabled" };
    let schedule = request.selector.identifier();
    if !changed {
        info!(entry_id = %handle.entry_id, schedule, "schedule already {state}");
        return Ok(false);
    }

    instances.commit(store, handle, candidate).await?;
    info!(entry_id = %handle.entry_id, schedule, "schedule {state}");
    Ok(true)
}

/// Replaces an entry's configuration, persists it and forces a cycle.
pub async fn replace_config(
    instances: &Instances,
    store: &AppStore,
    entry_id: Option<&str>,
    mut config: HeatingConfig,
) -> Result<HeatingConfig, ServiceError> {
    let handle = instances.resolve(entry_id)?;
    config.sanitize();

    let _changes = instances.changes.lock().await;
    if let Err(err) = instances.commit(store, handle, config.clone()).await {
        warn!(entry_id = %handle.entry_id, "configuration not saved, keeping the current one: {err}");
        return Err(err);
    }
    info!(entry_id = %handle.entry_id, "configuration updated");
    Ok(config)
}

pub fn refresh(instances: &Instances, entry_id: Option<&str>, force: bool) -> Result<(), ServiceError> {
    let handle = instances.resolve(entry_id)?;
    if force {
        handle.force_update_on_next_refresh();
    }
    handle.request_refresh();
    Ok(())
}
