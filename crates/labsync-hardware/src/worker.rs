//! Device worker task.
//!
//! Every open device gets one tokio task that owns its [`Driver`]. Callers
//! submit [`Command`]s over an mpsc queue and wait on a oneshot for the
//! result, so commands to one device run strictly in submission order while a
//! slow device never holds up another.
//!
//! Shutdown is signalled through a `watch` channel. A command that is in
//! flight when the signal arrives is dropped mid-await and its caller gets
//! [`LabError::NotOpen`]; queued commands are answered the same way before the
//! transport is closed.
//!
//! A command may carry a time limit. The limit is enforced here, around the
//! driver call, so a command that runs out of time stops occupying the device:
//! the caller gets [`LabError::Timeout`] and the transport discards whatever
//! reply arrives late.

use std::time::Duration;

use labsync_core::error::{LabError, LabResult};
use labsync_core::DeviceId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::drivers::{Command, Driver, Reply};

/// Queue depth per device.
const QUEUE_DEPTH: usize = 64;

struct Job {
    command: Command,
    limit: Option<Duration>,
    reply: oneshot::Sender<LabResult<Reply>>,
}

/// Owner side of a running worker.
pub(crate) struct WorkerHandle {
    device: DeviceId,
    jobs: mpsc::Sender<Job>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker around an already hand-shaken driver.
    pub(crate) fn spawn(device: DeviceId, driver: Driver) -> Self {
        let (jobs, queue) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(run(device.clone(), driver, queue, signal));
        Self {
            device,
            jobs,
            shutdown,
            task,
        }
    }

    /// Cheap handle for submitting commands without holding registry locks.
    pub(crate) fn submitter(&self) -> Submitter {
        Submitter {
            device: self.device.clone(),
            jobs: self.jobs.clone(),
        }
    }

    /// Signal shutdown and wait until the transport is released.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(device = %self.device, error = %e, "Device worker ended abnormally");
        }
    }
}

/// Sends commands to one worker.
#[derive(Clone)]
pub(crate) struct Submitter {
    device: DeviceId,
    jobs: mpsc::Sender<Job>,
}

impl Submitter {
    /// Queue `command` and wait for its result.
    pub(crate) async fn submit(&self, command: Command) -> LabResult<Reply> {
        self.submit_within(command, None).await
    }

    /// Queue `command`; once it starts, the driver gets at most `limit` to
    /// finish it.
    pub(crate) async fn submit_within(&self, command: Command, limit: Option<Duration>) -> LabResult<Reply> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(Job { command, limit, reply })
            .await
            .map_err(|_| self.closed())?;
        outcome.await.unwrap_or_else(|_| Err(self.closed()))
    }

    fn closed(&self) -> LabError {
        LabError::NotOpen {
            device: self.device.clone(),
            state: "closed".into(),
        }
    }
}

async fn run(
    device: DeviceId,
    mut driver: Driver,
    mut queue: mpsc::Receiver<Job>,
    mut signal: watch::Receiver<bool>,
) {
    tracing::debug!(device = %device, "Device worker started");
    let not_open = || LabError::NotOpen {
        device: device.clone(),
        state: "closed".into(),
    };

    loop {
        let job = tokio::select! {
            biased;
            _ = signal.changed() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Job { command, limit, reply } = job;
        if reply.is_closed() && matches!(command, Command::ReadStatus) {
            tracing::trace!(device = %device, "Skipping status read nobody waits for");
            continue;
        }

        let operation = command.operation();
        let call = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, driver.execute(&device, command)).await.ok(),
                None => Some(driver.execute(&device, command).await),
            }
        };
        let finished = tokio::select! {
            biased;
            _ = signal.changed() => {
                tracing::debug!(device = %device, operation = %operation, "In-flight command cancelled by disconnect");
                let _ = reply.send(Err(not_open()));
                break;
            }
            finished = call => finished,
        };

        let result = match finished {
            Some(result) => result,
            None => {
                driver.abandon();
                Err(LabError::Timeout {
                    device: device.clone(),
                    operation: operation.clone(),
                    after: limit.unwrap_or_default(),
                })
            }
        };

        if let Err(e) = &result {
            tracing::debug!(device = %device, operation = %operation, error = %e, "Command failed");
        }
        // The caller may have given up waiting; nothing to do then.
        let _ = reply.send(result);
    }

    queue.close();
    while let Ok(job) = queue.try_recv() {
        let _ = job.reply.send(Err(not_open()));
    }
    driver.close().await;
    tracing::debug!(device = %device, "Device worker stopped");
}
