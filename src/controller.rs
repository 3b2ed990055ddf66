//! Per-sensor simulation job controller.
//!
//! Each running sensor owns one tokio task that generates a reading, hands
//! it to a [`DeliverySink`] and sleeps for the configured interval. The job
//! table is the only shared mutable state and every check-cancel-insert
//! sequence runs under its mutex.
//!
//! A cancelled loop can still be finishing its last tick. Its successor for
//! the same sensor waits on the old loop's `finished` token before the first
//! tick, so a sensor never has two loops submitting at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::generator::ReadingGenerator;
use crate::ingest::IngestError;
use crate::offline::{Delivery, DeliverySink};
use crate::store::SensorRegistry;

/// Timing of simulation loops.
#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    /// Pause between two readings of one sensor
    pub interval: Duration,

    /// Pause after a failed tick before trying again
    pub error_backoff: Duration,

    /// How long `stop` waits for a loop to exit
    pub stop_timeout: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Whether a sensor currently has a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub active: bool,
}

/// Result of a `stop` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopOutcome {
    /// A job existed and was cancelled
    pub was_running: bool,

    /// The loop did not exit within the stop timeout
    pub timed_out: bool,
}

/// Per-sensor outcome inside a batch start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorOutcome {
    pub sensor_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `start_all_active_sensors`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub results: Vec<SensorOutcome>,
}

struct Job {
    generation: u64,
    cancel: CancellationToken,
    /// Fires once the loop task has exited
    finished: CancellationToken,
    handle: JoinHandle<()>,
}

/// A stopped loop that may still be inside its last tick.
struct Draining {
    generation: u64,
    finished: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    running: HashMap<String, Job>,
    draining: HashMap<String, Draining>,
}

impl JobTable {
    /// Take the running job out of the table and mark it as draining.
    fn retire(&mut self, sensor_id: &str) -> Option<Job> {
        let job = self.running.remove(sensor_id)?;
        job.cancel.cancel();
        self.draining.insert(
            sensor_id.to_string(),
            Draining {
                generation: job.generation,
                finished: job.finished.clone(),
            },
        );
        Some(job)
    }
}

struct Inner {
    jobs: Mutex<JobTable>,
    next_generation: AtomicU64,
    registry: Arc<dyn SensorRegistry>,
    sink: Arc<dyn DeliverySink>,
    generator: ReadingGenerator,
    settings: JobSettings,
}

/// Owner of all simulation jobs. Cloning shares the same job table.
#[derive(Clone)]
pub struct SimulationController {
    inner: Arc<Inner>,
}

impl SimulationController {
    pub fn new(
        registry: Arc<dyn SensorRegistry>,
        sink: Arc<dyn DeliverySink>,
        generator: ReadingGenerator,
        settings: JobSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(JobTable::default()),
                next_generation: AtomicU64::new(1),
                registry,
                sink,
                generator,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> JobSettings {
        self.inner.settings
    }

    pub fn generator(&self) -> &ReadingGenerator {
        &self.inner.generator
    }

    /// Start simulating `sensor_id`, replacing any job it already has.
    ///
    /// # Errors
    ///
    /// `NotFound` when the registry does not know the sensor, or the
    /// registry's own error when it cannot be queried.
    pub async fn start(&self, sensor_id: &str) -> Result<(), IngestError> {
        let sensor_id = sensor_id.trim();
        if sensor_id.is_empty() {
            return Err(IngestError::Validation("sensorId is required".to_string()));
        }

        if self.inner.registry.find_by_id(sensor_id).await?.is_none() {
            warn!(sensor_id = %sensor_id, "Cannot start simulation for unknown sensor");
            return Err(IngestError::NotFound(sensor_id.to_string()));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let replaced = {
            let mut jobs = self.inner.jobs.lock();
            let replaced = jobs.retire(sensor_id).is_some();
            let predecessor = jobs.draining.get(sensor_id).map(|d| d.finished.clone());

            let handle = tokio::spawn(run_job(
                self.inner.clone(),
                sensor_id.to_string(),
                generation,
                cancel.clone(),
                finished.clone(),
                predecessor,
            ));
            jobs.running.insert(
                sensor_id.to_string(),
                Job {
                    generation,
                    cancel,
                    finished,
                    handle,
                },
            );
            replaced
        };

        if replaced {
            info!(sensor_id = %sensor_id, "Replaced running simulation");
        } else {
            info!(
                sensor_id = %sensor_id,
                interval_secs = self.inner.settings.interval.as_secs_f64(),
                "Simulation started"
            );
        }

        Ok(())
    }

    /// Stop the job of `sensor_id`. Stopping an idle sensor is a no-op.
    pub async fn stop(&self, sensor_id: &str) -> StopOutcome {
        let job = self.inner.jobs.lock().retire(sensor_id);

        let Some(job) = job else {
            debug!(sensor_id = %sensor_id, "Stop requested for idle sensor");
            return StopOutcome::default();
        };

        let timed_out = !self.await_exit(sensor_id, job.handle).await;

        info!(sensor_id = %sensor_id, timed_out, "Simulation stopped");
        StopOutcome {
            was_running: true,
            timed_out,
        }
    }

    /// Cancel every job and clear the table. Returns how many were running.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(String, Job)> = {
            let mut jobs = self.inner.jobs.lock();
            let ids: Vec<String> = jobs.running.keys().cloned().collect();
            ids.into_iter()
                .filter_map(|id| jobs.retire(&id).map(|job| (id, job)))
                .collect()
        };
        let count = drained.len();

        for (sensor_id, job) in drained {
            self.await_exit(&sensor_id, job.handle).await;
        }

        if count > 0 {
            info!(stopped = count, "All simulations stopped");
        }
        count
    }

    /// Stop everything before the process exits.
    pub async fn shutdown(&self) {
        let stopped = self.stop_all().await;
        debug!(stopped, "Simulation controller shut down");
    }

    /// Whether `sensor_id` has a running job. Never touches storage.
    pub fn status(&self, sensor_id: &str) -> JobStatus {
        JobStatus {
            active: self.inner.jobs.lock().running.contains_key(sensor_id),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.jobs.lock().running.len()
    }

    /// Ids of sensors with a running job, sorted.
    pub fn active_sensor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a job for every active sensor in the registry.
    ///
    /// Individual failures are reported per sensor; only a failure to list
    /// the active sensors fails the whole call.
    pub async fn start_all_active_sensors(&self) -> Result<BatchReport, IngestError> {
        let sensors = self.inner.registry.find_active().await?;
        let mut report = BatchReport {
            total: sensors.len(),
            ..BatchReport::default()
        };

        for sensor in sensors {
            let outcome = match self.start(&sensor.id).await {
                Ok(()) => {
                    report.succeeded += 1;
                    SensorOutcome {
                        sensor_id: sensor.id,
                        success: true,
                        error: None,
                    }
                }
                Err(e) => {
                    error!(sensor_id = %sensor.id, error = %e, "Failed to start simulation");
                    SensorOutcome {
                        sensor_id: sensor.id,
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.results.push(outcome);
        }

        info!(total = report.total, succeeded = report.succeeded, "Batch start completed");
        Ok(report)
    }

    /// Wait for a cancelled loop; `false` when the stop timeout elapsed.
    async fn await_exit(&self, sensor_id: &str, handle: JoinHandle<()>) -> bool {
        match tokio::time::timeout(self.inner.settings.stop_timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(sensor_id = %sensor_id, error = %e, "Simulation task panicked");
                true
            }
            Err(_) => {
                warn!(
                    sensor_id = %sensor_id,
                    "Simulation task did not stop within {:?}",
                    self.inner.settings.stop_timeout
                );
                false
            }
        }
    }
}

/// Body of one sensor's simulation task.
async fn run_job(
    inner: Arc<Inner>,
    sensor_id: String,
    generation: u64,
    cancel: CancellationToken,
    finished: CancellationToken,
    predecessor: Option<CancellationToken>,
) {
    // Fires on every exit path, panics included
    let _finished = finished.drop_guard();

    // Not raced against our own cancel: a successor must never overtake a
    // loop that is still submitting
    if let Some(predecessor) = predecessor {
        if !predecessor.is_cancelled() {
            debug!(sensor_id = %sensor_id, generation, "Waiting for previous loop to exit");
            predecessor.cancelled().await;
        }
    }

    debug!(sensor_id = %sensor_id, generation, "Simulation loop running");

    while !cancel.is_cancelled() {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tick(&inner, &sensor_id) => result,
        };

        let pause = match result {
            Ok(()) => inner.settings.interval,
            Err(e) => {
                error!(sensor_id = %sensor_id, error = %e, "Simulation tick failed");
                inner.settings.error_backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    // A replacement job may already own the slot; only clear our own entries
    let mut jobs = inner.jobs.lock();
    if jobs.running.get(&sensor_id).map(|job| job.generation) == Some(generation) {
        jobs.running.remove(&sensor_id);
    }
    if jobs.draining.get(&sensor_id).map(|d| d.generation) == Some(generation) {
        jobs.draining.remove(&sensor_id);
    }
    drop(jobs);

    debug!(sensor_id = %sensor_id, generation, "Simulation loop finished");
}

/// Generate and deliver one reading.
async fn tick(inner: &Inner, sensor_id: &str) -> Result<(), IngestError> {
    // Re-read the sensor so type changes apply to the next reading
    let Some(sensor) = inner.registry.find_by_id(sensor_id).await? else {
        warn!(sensor_id = %sensor_id, "Sensor no longer registered, skipping tick");
        return Ok(());
    };

    let reading = inner.generator.generate_for(&sensor);
    match inner.sink.deliver(reading).await? {
        Delivery::Stored(stored) => {
            info!(
                sensor_id = %sensor_id,
                tipo = %stored.tipo,
                valor = stored.valor,
                unidad = %stored.unidad,
                "Simulated reading stored"
            );
        }
        Delivery::Buffered(entry) => {
            debug!(sensor_id = %sensor_id, queued_at = entry.queued_at, "Simulated reading buffered");
        }
    }
    Ok(())
}
