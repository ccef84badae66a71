//! Acquisition loop.
//!
//! Polls every open device on a fixed interval and publishes the results as
//! [`StatusEvent`]s on a broadcast channel. Each device has at most one status
//! read outstanding; a device that is still busy answering is skipped on the
//! next tick instead of piling up reads, so a slow instrument delays only its
//! own telemetry.
//!
//! Reads are bounded by `read_timeout` inside the device worker, so a read
//! that runs out of time also releases the device for other commands and
//! counts toward the registry's consecutive-failure limit. Failures become
//! [`StatusEvent::Fault`] and never stop the loop.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use labsync_core::error::LabError;
use labsync_core::{DeviceId, StatusEvent, StatusSnapshot};
use labsync_hardware::DeviceRegistry;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AcquisitionConfig;

const EVENT_CAPACITY: usize = 1024;

struct Shared {
    registry: Arc<DeviceRegistry>,
    read_timeout: Duration,
    events: broadcast::Sender<StatusEvent>,
    latest: RwLock<BTreeMap<DeviceId, StatusSnapshot>>,
}

impl Shared {
    async fn read_one(&self, id: &DeviceId) {
        let event = match self.registry.read_status_within(id, Some(self.read_timeout)).await {
            Ok(snapshot) => {
                self.latest.write().insert(id.clone(), snapshot.clone());
                StatusEvent::Snapshot(snapshot)
            }
            Err(e) => fault(id, &e),
        };
        if let StatusEvent::Fault { message, .. } = &event {
            debug!(device = %id, error = %message, "Status read failed");
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn fault(id: &DeviceId, err: &LabError) -> StatusEvent {
    StatusEvent::Fault {
        device: id.clone(),
        timestamp: Utc::now(),
        kind: err.kind(),
        message: err.to_string(),
    }
}

/// Periodic status poller.
pub struct AcquisitionLoop {
    shared: Arc<Shared>,
    interval: Duration,
}

impl AcquisitionLoop {
    /// Poll every `interval`, bounding each read by `read_timeout`.
    pub fn new(registry: Arc<DeviceRegistry>, interval: Duration, read_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                registry,
                read_timeout,
                events,
                latest: RwLock::new(BTreeMap::new()),
            }),
            interval,
        }
    }

    /// Loop using the `[acquisition]` configuration section.
    pub fn from_config(registry: Arc<DeviceRegistry>, config: &AcquisitionConfig) -> Self {
        Self::new(registry, config.poll_interval, config.read_timeout)
    }

    /// Subscribe to snapshots and faults.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.events.subscribe()
    }

    /// Most recent successful snapshot of a device.
    pub fn latest(&self, id: &DeviceId) -> Option<StatusSnapshot> {
        self.shared.latest.read().get(id).cloned()
    }

    /// Most recent snapshot of every device that answered at least once.
    pub fn snapshots(&self) -> BTreeMap<DeviceId, StatusSnapshot> {
        self.shared.latest.read().clone()
    }

    /// Spawn the polling task.
    pub fn start(&self) -> AcquisitionHandle {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(run(self.shared.clone(), self.interval, signal));
        AcquisitionHandle { shutdown, task }
    }
}

/// Running acquisition loop.
pub struct AcquisitionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AcquisitionHandle {
    /// Stop polling and cancel outstanding reads.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Acquisition loop ended abnormally");
        }
    }
}

async fn run(shared: Arc<Shared>, interval: Duration, mut signal: watch::Receiver<bool>) {
    info!(interval = ?interval, read_timeout = ?shared.read_timeout, "Acquisition loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reads: JoinSet<DeviceId> = JoinSet::new();
    let mut outstanding: HashSet<DeviceId> = HashSet::new();

    loop {
        tokio::select! {
            biased;
            _ = signal.changed() => break,
            Some(done) = reads.join_next(), if !reads.is_empty() => match done {
                Ok(id) => {
                    outstanding.remove(&id);
                }
                Err(e) => warn!(error = %e, "Status read task failed"),
            },
            _ = ticker.tick() => {
                for id in shared.registry.open_devices() {
                    if !outstanding.insert(id.clone()) {
                        debug!(device = %id, "Previous read still outstanding; skipping");
                        continue;
                    }
                    let shared = shared.clone();
                    reads.spawn(async move {
                        shared.read_one(&id).await;
                        id
                    });
                }
            }
        }
    }

    reads.shutdown().await;
    info!("Acquisition loop stopped");
}
