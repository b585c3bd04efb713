use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use chrono_tz::Tz;
use heating_common::{
    calculate_heating_state, classify_outdoor, parse_reading, ConfigEntry, ControllerConfig,
    CycleInputs, DeviceDecision, HeatingConfig, HeatingStateSnapshot, OutdoorState, PresenceState,
    TimeOfDay, Transition, TransitionDetector, WatchdogHealth,
};
use thiserror::Error;
use tokio::{
    sync::{watch, Notify, RwLock},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    climate::ClimateController,
    entity::{EntityState, HostApi, HostError},
};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to read {entity_id}: {source}")]
    StateLookup {
        entity_id: String,
        #[source]
        source: HostError,
    },

    #[error("control round did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Health derived from recent cycle outcomes.
#[derive(Debug, Clone)]
struct Watchdog {
    stuck_after_failures: u32,
    consecutive_failures: u32,
    last_cycle_timed_out: bool,
}

impl Watchdog {
    fn new(stuck_after_failures: u32) -> Self {
        Self {
            stuck_after_failures,
            consecutive_failures: 0,
            last_cycle_timed_out: false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_cycle_timed_out = false;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_cycle_timed_out = false;
    }

    fn record_timeout(&mut self) {
        self.consecutive_failures += 1;
        self.last_cycle_timed_out = true;
    }

    fn health(&self, resync_pending: bool) -> WatchdogHealth {
        if self.last_cycle_timed_out || self.consecutive_failures >= self.stuck_after_failures {
            WatchdogHealth::Stuck
        } else if resync_pending {
            WatchdogHealth::Degraded
        } else {
            WatchdogHealth::Healthy
        }
    }
}

/// Shared view of one running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub entry_id: String,
    pub title: String,
    config: Arc<RwLock<HeatingConfig>>,
    force: Arc<AtomicBool>,
    refresh: Arc<Notify>,
    snapshot: watch::Receiver<Option<HeatingStateSnapshot>>,
}

impl CoordinatorHandle {
    /// The next cycle re-applies every decision with a clean command history.
    pub fn force_update_on_next_refresh(&self) {
        info!(entry_id = %self.entry_id, "forcing update on next refresh");
        self.force.store(true, Ordering::SeqCst);
    }

    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub async fn config(&self) -> HeatingConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config<R>(&self, update: impl FnOnce(&mut HeatingConfig) -> R) -> R {
        let mut config = self.config.write().await;
        update(&mut config)
    }

    pub async fn to_entry(&self) -> ConfigEntry {
        ConfigEntry {
            entry_id: self.entry_id.clone(),
            title: self.title.clone(),
            config: self.config().await,
        }
    }

    pub fn snapshot(&self) -> Option<HeatingStateSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<HeatingStateSnapshot>> {
        self.snapshot.clone()
    }
}

/// Owns the periodic cycle for one configuration entry: gather live inputs,
/// compute the snapshot, gate on transitions, drive the controller.
pub struct Coordinator {
    entry_id: String,
    host: Arc<dyn HostApi>,
    settings: ControllerConfig,
    timezone: Tz,
    config: Arc<RwLock<HeatingConfig>>,
    force: Arc<AtomicBool>,
    refresh: Arc<Notify>,
    snapshot_tx: watch::Sender<Option<HeatingStateSnapshot>>,
    detector: TransitionDetector,
    controller: ClimateController,
    outdoor_state: OutdoorState,
    watchdog: Watchdog,
}

impl Coordinator {
    pub fn new(
        entry: ConfigEntry,
        host: Arc<dyn HostApi>,
        settings: ControllerConfig,
        timezone: Tz,
    ) -> (Self, CoordinatorHandle) {
        let config = Arc::new(RwLock::new(entry.config));
        let force = Arc::new(AtomicBool::new(false));
        let refresh = Arc::new(Notify::new());
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let handle = CoordinatorHandle {
            entry_id: entry.entry_id.clone(),
            title: entry.title,
            config: config.clone(),
            force: force.clone(),
            refresh: refresh.clone(),
            snapshot: snapshot_rx,
        };

        let coordinator = Self {
            entry_id: entry.entry_id,
            controller: ClimateController::new(host.clone(), settings.clone()),
            watchdog: Watchdog::new(settings.stuck_after_failures),
            host,
            settings,
            timezone,
            config,
            force,
            refresh,
            snapshot_tx,
            detector: TransitionDetector::new(),
            outdoor_state: OutdoorState::Unknown,
        };

        (coordinator, handle)
    }

    /// Runs cycles on the update interval and on refresh requests. Cycles never
    /// overlap; ticks missed while a cycle runs are dropped.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.settings.update_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let refresh = self.refresh.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = refresh.notified() => debug!(entry_id = %self.entry_id, "refresh requested"),
            }

            let now = local_time(self.timezone);
            match self.run_cycle_at(now).await {
                Ok(_) => {}
                Err(err @ CycleError::TimedOut(_)) => {
                    error!(entry_id = %self.entry_id, "heating cycle failed: {err}");
                }
                Err(err) => warn!(entry_id = %self.entry_id, "heating cycle failed: {err}"),
            }
        }
    }

    /// One full cycle evaluated at `now`. The resulting snapshot is published
    /// even when the control round times out.
    pub async fn run_cycle_at(&mut self, now: TimeOfDay) -> Result<HeatingStateSnapshot, CycleError> {
        let started = Instant::now();
        let config = self.config.read().await.clone();

        let inputs = match self.gather_inputs(&config, now).await {
            Ok(inputs) => inputs,
            Err(err) => {
                self.watchdog.record_failure();
                self.publish_health();
                return Err(err);
            }
        };

        let mut snapshot = calculate_heating_state(&config, &inputs);
        self.controller
            .retain_devices(snapshot.control_targets().map(|d| d.entity_id.as_str()));
        let force = self.force.swap(false, Ordering::SeqCst);
        let outcome = match self.detector.observe(&snapshot, force) {
            Some(transition) => {
                info!(entry_id = %self.entry_id, "{transition}, applying control decisions");
                if transition == Transition::Forced {
                    self.controller.reset_history();
                }
                let targets: Vec<DeviceDecision> = snapshot.control_targets().cloned().collect();
                self.apply_bounded(&targets).await
            }
            None if self.controller.needs_retry() => {
                let targets: Vec<DeviceDecision> = snapshot
                    .control_targets()
                    .filter(|decision| self.controller.owes_round(&decision.entity_id))
                    .cloned()
                    .collect();
                info!(
                    entry_id = %self.entry_id,
                    devices = targets.len(),
                    "retrying devices that missed their last round"
                );
                self.apply_bounded(&targets).await
            }
            None => {
                debug!(
                    entry_id = %self.entry_id,
                    "no state transitions, skipping control application (preserving manual changes)"
                );
                Ok(())
            }
        };

        match &outcome {
            Ok(()) => self.watchdog.record_success(),
            Err(_) => self.watchdog.record_timeout(),
        }

        let pending = self.controller.pending_resync().clone();
        let diagnostics = &mut snapshot.diagnostics;
        diagnostics.last_update_duration_ms =
            Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        diagnostics.watchdog = self.watchdog.health(!pending.is_empty());
        diagnostics.timed_out_devices = pending;

        self.snapshot_tx.send_replace(Some(snapshot.clone()));
        outcome.map(|()| snapshot)
    }

    async fn apply_bounded(&mut self, targets: &[DeviceDecision]) -> Result<(), CycleError> {
        let limit = self.settings.cycle_timeout(targets.len());
        match tokio::time::timeout(limit, self.controller.apply(targets)).await {
            Ok(failed) => {
                if !failed.is_empty() {
                    warn!(
                        entry_id = %self.entry_id,
                        devices = ?failed,
                        "devices failed this round and will be resynced"
                    );
                }
                Ok(())
            }
            Err(_) => {
                // The interrupted device never recorded its round.
                self.force.store(true, Ordering::SeqCst);
                Err(CycleError::TimedOut(limit))
            }
        }
    }

    async fn gather_inputs(
        &mut self,
        config: &HeatingConfig,
        now: TimeOfDay,
    ) -> Result<CycleInputs, CycleError> {
        let mut trackers = Vec::with_capacity(config.device_trackers.len());
        for tracker in &config.device_trackers {
            let home = self.lookup(tracker).await?.is_some_and(|state| state.is_home());
            trackers.push((tracker.clone(), home));
        }
        let presence = PresenceState::from_trackers(trackers);

        let outdoor_temp = match &config.outdoor_temp_sensor {
            Some(sensor) => self
                .lookup(sensor)
                .await?
                .and_then(|state| parse_reading(&state.state)),
            None => None,
        };
        self.outdoor_state = classify_outdoor(
            outdoor_temp,
            config.outdoor_temp_threshold,
            config.outdoor_temp_hysteresis,
            self.outdoor_state,
        );

        Ok(CycleInputs {
            now,
            presence,
            outdoor_temp,
            outdoor_state: self.outdoor_state,
        })
    }

    async fn lookup(&self, entity_id: &str) -> Result<Option<EntityState>, CycleError> {
        self.host
            .get_state(entity_id)
            .await
            .map_err(|source| CycleError::StateLookup {
                entity_id: entity_id.to_string(),
                source,
            })
    }

    fn publish_health(&self) {
        let health = self
            .watchdog
            .health(!self.controller.pending_resync().is_empty());
        self.snapshot_tx.send_modify(|current| {
            if let Some(snapshot) = current {
                snapshot.diagnostics.watchdog = health;
            }
        });
    }
}

fn local_time(timezone: Tz) -> TimeOfDay {
    TimeOfDay::from_chrono(Utc::now().with_timezone(&timezone).time())
}
