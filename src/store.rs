//! Persistence collaborators: the sensor registry and the reading store.
//!
//! The service only needs insert, filtered find and count, so both are
//! traits. The in-memory implementations back the server binary and the
//! tests; `MemoryStore` can be switched offline to simulate an outage.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

use crate::reading::{Reading, ReadingKind, Sensor};

/// Errors raised by a persistence backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend cannot be reached right now; the operation may succeed later
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Internal(String),
}

/// Filter over stored readings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub sensor_id: Option<String>,
    pub tipo: Option<ReadingKind>,
    /// Inclusive lower bound on `fecha_hora`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `fecha_hora`
    pub to: Option<DateTime<Utc>>,
}

impl ReadingFilter {
    pub fn for_sensor(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: Some(sensor_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, reading: &Reading) -> bool {
        self.sensor_id.as_ref().map_or(true, |id| *id == reading.sensor_id)
            && self.tipo.map_or(true, |tipo| tipo == reading.tipo)
            && self.from.map_or(true, |from| reading.fecha_hora >= from)
            && self.to.map_or(true, |to| reading.fecha_hora <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Append-only reading storage.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Persist one reading and return it as stored.
    async fn insert(&self, reading: Reading) -> Result<Reading, StoreError>;

    /// Find readings matching `filter`, ordered by `fecha_hora`.
    async fn find(
        &self,
        filter: &ReadingFilter,
        sort: SortOrder,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError>;

    async fn count(&self, filter: &ReadingFilter) -> Result<u64, StoreError>;
}

/// Lookup of sensor records.
#[async_trait]
pub trait SensorRegistry: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Sensor>, StoreError>;

    /// Sensors whose estado is "activo".
    async fn find_active(&self) -> Result<Vec<Sensor>, StoreError>;

    async fn list(&self) -> Result<Vec<Sensor>, StoreError>;
}

/// In-memory reading store.
#[derive(Debug)]
pub struct MemoryStore {
    readings: RwLock<Vec<Reading>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            readings: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Take the store offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of stored readings, regardless of availability.
    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.read().is_empty()
    }

    /// Copy of every stored reading in insertion order.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.read().clone()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("reading store is offline".to_string()))
        }
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert(&self, reading: Reading) -> Result<Reading, StoreError> {
        self.ensure_available()?;
        self.readings.write().push(reading.clone());
        Ok(reading)
    }

    async fn find(
        &self,
        filter: &ReadingFilter,
        sort: SortOrder,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        self.ensure_available()?;

        let mut matching: Vec<Reading> = self
            .readings
            .read()
            .iter()
            .filter(|reading| filter.matches(reading))
            .cloned()
            .collect();

        // Stable sort keeps insertion order for equal timestamps
        match sort {
            SortOrder::NewestFirst => matching.sort_by(|a, b| b.fecha_hora.cmp(&a.fecha_hora)),
            SortOrder::OldestFirst => matching.sort_by(|a, b| a.fecha_hora.cmp(&b.fecha_hora)),
        }

        Ok(matching.into_iter().skip(skip).take(limit).collect())
    }

    async fn count(&self, filter: &ReadingFilter) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let count = self
            .readings
            .read()
            .iter()
            .filter(|reading| filter.matches(reading))
            .count();
        Ok(count as u64)
    }
}

/// In-memory sensor registry, ordered by insertion.
#[derive(Debug, Default)]
pub struct MemorySensorRegistry {
    sensors: RwLock<Vec<Sensor>>,
}

impl MemorySensorRegistry {
    pub fn new(sensors: Vec<Sensor>) -> Self {
        Self {
            sensors: RwLock::new(sensors),
        }
    }

    /// Load sensors from a JSON array file.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Internal(format!("cannot read {}: {}", path.display(), e)))?;
        let sensors: Vec<Sensor> = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Internal(format!("invalid sensors file {}: {}", path.display(), e)))?;
        Ok(Self::new(sensors))
    }

    /// Registry holding the four demo sensors of the garden simulator.
    pub fn demo() -> Self {
        Self::new(demo_sensors())
    }

    /// Insert a sensor or replace the one with the same id.
    pub fn upsert(&self, sensor: Sensor) {
        let mut sensors = self.sensors.write();
        match sensors.iter_mut().find(|existing| existing.id == sensor.id) {
            Some(existing) => *existing = sensor,
            None => sensors.push(sensor),
        }
    }

    /// Remove a sensor, returning it if it existed.
    pub fn remove(&self, id: &str) -> Option<Sensor> {
        let mut sensors = self.sensors.write();
        let index = sensors.iter().position(|sensor| sensor.id == id)?;
        Some(sensors.remove(index))
    }

    pub fn len(&self) -> usize {
        self.sensors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.read().is_empty()
    }
}

#[async_trait]
impl SensorRegistry for MemorySensorRegistry {
    async fn find_by_id(&self, id: &str) -> Result<Option<Sensor>, StoreError> {
        Ok(self.sensors.read().iter().find(|sensor| sensor.id == id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self
            .sensors
            .read()
            .iter()
            .filter(|sensor| sensor.is_active())
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self.sensors.read().clone())
    }
}

/// The four plant sensors the garden simulator ships with.
pub fn demo_sensors() -> Vec<Sensor> {
    let specs = [
        ("648a1b2c3d4e5f6789012341", "temperatura", "DHT22"),
        ("648a1b2c3d4e5f6789012342", "humedad", "DHT22"),
        ("648a1b2c3d4e5f6789012343", "temperatura", "DS18B20"),
        ("648a1b2c3d4e5f6789012344", "mixto", "BME280"),
    ];

    specs
        .iter()
        .enumerate()
        .map(|(index, (id, tipo, modelo))| {
            let mut sensor = Sensor::new(*id, *tipo);
            sensor.modelo = modelo.to_string();
            sensor.descripcion = format!("Planta {}", index + 1);
            sensor
        })
        .collect()
}
