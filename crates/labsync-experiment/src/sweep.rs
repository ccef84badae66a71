//! Sweep coordinator.
//!
//! Drives a logarithmic frequency sweep across a frequency generator and a
//! spectrum analyzer. For every planned point the coordinator
//!
//! 1. sets the generator frequency on channel [`SWEEP_GENERATOR_CHANNEL`],
//! 2. waits for the configured settle delay,
//! 3. asks the analyzer for the amplitude at that frequency,
//! 4. appends the point to the shared [`SweepResult`].
//!
//! # State machine
//!
//! ```text
//! Idle → Planning → Running → Completed
//!                          ↘ Aborted
//!                          ↘ Failed
//! ```
//!
//! Only one sweep runs at a time; `start` while Planning or Running fails with
//! [`LabError::Busy`]. Abort requests are honoured between points, so a
//! command already on the wire always completes. A failing point ends the
//! sweep but keeps every point measured before it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use labsync_core::error::{LabError, LabResult};
use labsync_core::limits::{SETTLE_DELAY, SWEEP_GENERATOR_CHANNEL};
use labsync_core::{DeviceId, ParameterValue};
use labsync_hardware::DeviceRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::plans::{SweepPlan, SweepRequest};
use crate::result::{SweepOutcome, SweepPoint, SweepResult};

/// Analyzer settings written before the first point.
fn bode_defaults() -> [(&'static str, ParameterValue); 4] {
    [
        ("span", ParameterValue::Float(1.0e3)),
        ("sweep_points", ParameterValue::Int(2001)),
        ("sweep_type", ParameterValue::Text("swe".into())),
        ("unit", ParameterValue::Text("dbm".into())),
    ]
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    /// No sweep has run yet
    Idle,
    /// Building the frequency list and checking devices
    Planning,
    /// Measuring points
    Running,
    /// Every point measured
    Completed,
    /// Stopped on request
    Aborted,
    /// Stopped by a device error
    Failed,
}

impl SweepState {
    /// True while a sweep owns the instruments.
    pub fn is_active(self) -> bool {
        matches!(self, SweepState::Planning | SweepState::Running)
    }
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepState::Idle => write!(f, "Idle"),
            SweepState::Planning => write!(f, "Planning"),
            SweepState::Running => write!(f, "Running"),
            SweepState::Completed => write!(f, "Completed"),
            SweepState::Aborted => write!(f, "Aborted"),
            SweepState::Failed => write!(f, "Failed"),
        }
    }
}

impl From<&SweepOutcome> for SweepState {
    fn from(outcome: &SweepOutcome) -> Self {
        match outcome {
            SweepOutcome::Completed => SweepState::Completed,
            SweepOutcome::Aborted => SweepState::Aborted,
            SweepOutcome::Failed { .. } => SweepState::Failed,
        }
    }
}

/// Progress published while a sweep runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SweepEvent {
    /// The coordinator changed state
    State {
        /// New state
        state: SweepState,
    },
    /// A point was measured
    Point {
        /// Zero-based point index
        index: usize,
        /// Planned number of points
        total: usize,
        /// The measurement
        point: SweepPoint,
    },
    /// The sweep ended
    Finished {
        /// Terminal outcome
        outcome: SweepOutcome,
    },
}

/// Which instruments a sweep drives and how long it waits per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Frequency generator id
    pub generator: DeviceId,
    /// Spectrum analyzer id
    pub analyzer: DeviceId,
    /// Wait between setting the generator and measuring
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
    /// Write span, trace points, sweep type and unit before the first point
    #[serde(default = "default_bode_defaults")]
    pub bode_defaults: bool,
}

fn default_settle_delay() -> Duration {
    SETTLE_DELAY
}

fn default_bode_defaults() -> bool {
    true
}

impl SweepSettings {
    /// Settings with the default settle delay.
    pub fn new(generator: impl Into<String>, analyzer: impl Into<String>) -> Self {
        Self {
            generator: DeviceId::new(generator),
            analyzer: DeviceId::new(analyzer),
            settle_delay: SETTLE_DELAY,
            bode_defaults: true,
        }
    }

    /// Override the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Leave the analyzer setup untouched.
    pub fn without_bode_defaults(mut self) -> Self {
        self.bode_defaults = false;
        self
    }
}

/// Runs one sweep at a time against a shared registry.
pub struct SweepCoordinator {
    registry: Arc<DeviceRegistry>,
    settings: SweepSettings,
    state: RwLock<SweepState>,
    result: RwLock<SweepResult>,
    events: broadcast::Sender<SweepEvent>,
    abort_requested: AtomicBool,
}

impl SweepCoordinator {
    /// Create an idle coordinator.
    pub fn new(registry: Arc<DeviceRegistry>, settings: SweepSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            settings,
            state: RwLock::new(SweepState::Idle),
            result: RwLock::new(SweepResult::new(0)),
            events,
            abort_requested: AtomicBool::new(false),
        }
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.events.subscribe()
    }

    /// Current state.
    pub async fn state(&self) -> SweepState {
        *self.state.read().await
    }

    /// Copy of the current or last result.
    pub async fn result(&self) -> SweepResult {
        self.result.read().await.clone()
    }

    /// Instruments and timing in use.
    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// Plan a sweep and run it on a background task.
    ///
    /// Returns once planning succeeded; the handle resolves to the outcome.
    pub async fn start(self: &Arc<Self>, request: SweepRequest) -> LabResult<JoinHandle<SweepOutcome>> {
        let plan = self.plan(&request).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(plan).await }))
    }

    /// Plan and run a sweep on the caller's task.
    pub async fn run(&self, request: SweepRequest) -> LabResult<SweepOutcome> {
        let plan = self.plan(&request).await?;
        Ok(self.execute(plan).await)
    }

    /// Request an abort. Takes effect before the next point.
    ///
    /// Returns false when no sweep is active.
    pub async fn abort(&self) -> bool {
        let state = *self.state.read().await;
        if !state.is_active() {
            return false;
        }
        info!("Sweep abort requested; stops at next point boundary");
        self.abort_requested.store(true, Ordering::SeqCst);
        true
    }

    async fn plan(&self, request: &SweepRequest) -> LabResult<SweepPlan> {
        {
            let mut state = self.state.write().await;
            if state.is_active() {
                return Err(LabError::Busy(format!("Cannot start: sweep is {}", *state)));
            }
            *state = SweepState::Planning;
            self.abort_requested.store(false, Ordering::SeqCst);
        }
        let _ = self.events.send(SweepEvent::State {
            state: SweepState::Planning,
        });

        let planned = SweepPlan::from_request(request)
            .map_err(LabError::from)
            .and_then(|plan| {
                self.require_open(&self.settings.generator)?;
                self.require_open(&self.settings.analyzer)?;
                Ok(plan)
            });

        match planned {
            Ok(plan) => {
                *self.result.write().await = SweepResult::new(plan.len());
                Ok(plan)
            }
            Err(e) => {
                *self.result.write().await = SweepResult::new(0);
                self.finish(SweepOutcome::Failed { reason: e.to_string() }).await;
                Err(e)
            }
        }
    }

    fn require_open(&self, id: &DeviceId) -> LabResult<()> {
        let state = self.registry.state(id)?;
        if state.is_open() {
            Ok(())
        } else {
            Err(LabError::NotOpen {
                device: id.clone(),
                state: state.to_string(),
            })
        }
    }

    async fn execute(&self, plan: SweepPlan) -> SweepOutcome {
        *self.state.write().await = SweepState::Running;
        let _ = self.events.send(SweepEvent::State {
            state: SweepState::Running,
        });
        let total = plan.len();
        info!(
            points = total,
            generator = %self.settings.generator,
            analyzer = %self.settings.analyzer,
            "Sweep started"
        );

        if self.settings.bode_defaults {
            if let Err(e) = self.write_bode_defaults().await {
                warn!(error = %e, "Analyzer setup failed");
                return self.finish(SweepOutcome::Failed { reason: e.to_string() }).await;
            }
        }

        for (index, &frequency_hz) in plan.frequencies().iter().enumerate() {
            if self.abort_requested.load(Ordering::SeqCst) {
                info!(completed = index, total, "Sweep aborted");
                return self.finish(SweepOutcome::Aborted).await;
            }

            match self.measure_point(frequency_hz).await {
                Ok(amplitude) => {
                    let point = SweepPoint {
                        frequency_hz,
                        amplitude,
                    };
                    self.result.write().await.push(point);
                    tracing::debug!(index, frequency_hz, amplitude, "Sweep point");
                    let _ = self.events.send(SweepEvent::Point { index, total, point });
                }
                Err(e) => {
                    warn!(index, frequency_hz, error = %e, "Sweep point failed");
                    return self.finish(SweepOutcome::Failed { reason: e.to_string() }).await;
                }
            }
        }

        info!(points = total, "Sweep completed");
        self.finish(SweepOutcome::Completed).await
    }

    async fn write_bode_defaults(&self) -> LabResult<()> {
        for (key, value) in bode_defaults() {
            self.registry
                .write_parameter(&self.settings.analyzer, key, value)
                .await?;
        }
        Ok(())
    }

    async fn measure_point(&self, frequency_hz: f64) -> LabResult<f64> {
        self.registry
            .set_frequency(&self.settings.generator, frequency_hz, SWEEP_GENERATOR_CHANNEL)
            .await?;
        tokio::time::sleep(self.settings.settle_delay).await;
        self.registry.measure_at(&self.settings.analyzer, frequency_hz).await
    }

    async fn finish(&self, outcome: SweepOutcome) -> SweepOutcome {
        self.result.write().await.finish(outcome.clone());
        let state = SweepState::from(&outcome);
        *self.state.write().await = state;
        let _ = self.events.send(SweepEvent::State { state });
        let _ = self.events.send(SweepEvent::Finished {
            outcome: outcome.clone(),
        });
        outcome
    }
}
