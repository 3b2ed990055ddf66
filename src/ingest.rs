//! Reading ingestion: validation, persistence and the read queries behind
//! the `/lecturas` endpoints.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::reading::{new_reading_id, NewReading, Reading, ReadingKind};
use crate::store::{ReadingFilter, ReadingStore, SensorRegistry, SortOrder, StoreError};

/// Largest page or "latest N" size a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Page size used by the listing when none is given.
pub const DEFAULT_PAGE_SIZE: usize = 15;

/// Count used by the latest-readings query when none is given.
pub const DEFAULT_LATEST_LIMIT: usize = 10;

/// Errors returned when submitting a reading.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IngestError {
    /// Caller error: bad shape or out-of-range value. Never retried.
    #[error("invalid reading: {0}")]
    Validation(String),

    #[error("sensor '{0}' not found")]
    NotFound(String),

    /// Transient: the reading should be buffered and resent later.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether resending the same reading later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::StorageUnavailable(_))
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => IngestError::StorageUnavailable(msg),
            StoreError::Internal(msg) => IngestError::Internal(msg),
        }
    }
}

/// Accepted value range for one reading kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueBounds {
    pub min: f64,
    pub max: f64,
}

impl ValueBounds {
    pub const TEMPERATURE_DEFAULT: ValueBounds = ValueBounds { min: -50.0, max: 100.0 };
    pub const HUMIDITY: ValueBounds = ValueBounds { min: 0.0, max: 100.0 };

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// How strictly a submission's sensor reference is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorCheck {
    /// Only type and bounds are validated
    #[default]
    None,
    /// The sensor must be registered
    Exists,
    /// The sensor must be registered and active
    ExistsAndActive,
}

impl FromStr for SensorCheck {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "none" => Ok(SensorCheck::None),
            "exists" => Ok(SensorCheck::Exists),
            "active" => Ok(SensorCheck::ExistsAndActive),
            other => Err(format!("'{}' is not one of none, exists, active", other)),
        }
    }
}

/// Destination for generated readings.
///
/// Implemented by the in-process [`Ingestor`] and by the HTTP client used by
/// the standalone simulator.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn submit(&self, reading: NewReading) -> Result<Reading, IngestError>;
}

#[async_trait]
impl<T: ReadingSink + ?Sized> ReadingSink for Arc<T> {
    async fn submit(&self, reading: NewReading) -> Result<Reading, IngestError> {
        (**self).submit(reading).await
    }
}

/// Query parameters of the paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filter: ReadingFilter,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
    pub total_records: u64,
    pub page_size: usize,
}

impl Pagination {
    pub fn new(current_page: usize, page_size: usize, total_records: u64) -> Self {
        let total_pages = (total_records as usize).div_ceil(page_size.max(1));
        Self {
            current_page,
            total_pages,
            total_records,
            page_size,
        }
    }

    /// Number of records before the current page.
    pub fn offset(&self) -> usize {
        self.current_page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingPage {
    pub data: Vec<Reading>,
    pub pagination: Pagination,
}

/// Aggregate over the readings of one (sensor, kind) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingStats {
    pub sensor_id: String,
    pub tipo: ReadingKind,
    pub ultima_lectura: DateTime<Utc>,
    pub promedio: f64,
    pub minimo: f64,
    pub maximo: f64,
    pub total: u64,
}

/// Validates readings and persists them through a [`ReadingStore`].
pub struct Ingestor {
    store: Arc<dyn ReadingStore>,
    sensors: Arc<dyn SensorRegistry>,
    temperature_bounds: ValueBounds,
    sensor_check: SensorCheck,
}

impl Ingestor {
    pub fn new(store: Arc<dyn ReadingStore>, sensors: Arc<dyn SensorRegistry>) -> Self {
        Self {
            store,
            sensors,
            temperature_bounds: ValueBounds::TEMPERATURE_DEFAULT,
            sensor_check: SensorCheck::None,
        }
    }

    pub fn with_temperature_bounds(mut self, bounds: ValueBounds) -> Self {
        self.temperature_bounds = bounds;
        self
    }

    pub fn with_sensor_check(mut self, check: SensorCheck) -> Self {
        self.sensor_check = check;
        self
    }

    pub fn sensor_check(&self) -> SensorCheck {
        self.sensor_check
    }

    pub fn store(&self) -> &Arc<dyn ReadingStore> {
        &self.store
    }

    /// Bounds applied to values of `kind`.
    pub fn bounds_for(&self, kind: ReadingKind) -> ValueBounds {
        match kind {
            ReadingKind::Temperature => self.temperature_bounds,
            ReadingKind::Humidity => ValueBounds::HUMIDITY,
        }
    }

    /// Validate a submission and store it, applying the configured sensor check.
    pub async fn ingest(&self, submission: NewReading) -> Result<Reading, IngestError> {
        self.ingest_with(submission, self.sensor_check).await
    }

    /// Validate a submission and store it with an explicit sensor check.
    pub async fn ingest_with(
        &self,
        submission: NewReading,
        check: SensorCheck,
    ) -> Result<Reading, IngestError> {
        let reading = self.validate(submission)?;
        self.check_sensor(&reading.sensor_id, check).await?;

        let stored = self.store.insert(reading).await?;
        debug!(
            sensor_id = %stored.sensor_id,
            tipo = %stored.tipo,
            valor = stored.valor,
            "Reading stored"
        );
        Ok(stored)
    }

    /// Turn a submission into a storable reading or explain why it is invalid.
    pub fn validate(&self, submission: NewReading) -> Result<Reading, IngestError> {
        let sensor_id = submission
            .sensor_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| IngestError::Validation("sensorId is required".to_string()))?;

        let tipo_raw = submission
            .tipo
            .filter(|tipo| !tipo.trim().is_empty())
            .ok_or_else(|| IngestError::Validation("tipo is required".to_string()))?;

        let tipo = ReadingKind::parse(&tipo_raw).ok_or_else(|| {
            IngestError::Validation(format!(
                "tipo '{}' is not one of temperatura, humedad",
                tipo_raw.trim()
            ))
        })?;

        let valor = submission
            .valor
            .ok_or_else(|| IngestError::Validation("valor is required".to_string()))?;
        if !valor.is_finite() {
            return Err(IngestError::Validation("valor must be a finite number".to_string()));
        }

        let bounds = self.bounds_for(tipo);
        if !bounds.contains(valor) {
            return Err(IngestError::Validation(format!(
                "{} value {} outside valid range ({} to {})",
                tipo, valor, bounds.min, bounds.max
            )));
        }

        let unidad = submission
            .unidad
            .map(|unidad| unidad.trim().to_string())
            .filter(|unidad| !unidad.is_empty())
            .unwrap_or_else(|| tipo.unit().to_string());

        let fecha_hora = submission
            .fecha_hora
            .filter(|fecha| fecha.timestamp_millis() != 0)
            .unwrap_or_else(Utc::now);

        Ok(Reading {
            id: new_reading_id(),
            sensor_id,
            fecha_hora,
            tipo,
            valor,
            unidad,
        })
    }

    async fn check_sensor(&self, sensor_id: &str, check: SensorCheck) -> Result<(), IngestError> {
        if check == SensorCheck::None {
            return Ok(());
        }

        let sensor = self
            .sensors
            .find_by_id(sensor_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(sensor_id.to_string()))?;

        if check == SensorCheck::ExistsAndActive && !sensor.is_active() {
            warn!(sensor_id = %sensor_id, estado = %sensor.estado, "Rejected reading for inactive sensor");
            return Err(IngestError::NotFound(sensor_id.to_string()));
        }

        Ok(())
    }

    /// Newest readings of one sensor; `limit` is clamped to `[1, 100]`.
    pub async fn latest(&self, sensor_id: &str, limit: Option<usize>) -> Result<Vec<Reading>, IngestError> {
        let limit = clamp_limit(limit, DEFAULT_LATEST_LIMIT);
        let filter = ReadingFilter::for_sensor(sensor_id);
        Ok(self.store.find(&filter, SortOrder::NewestFirst, 0, limit).await?)
    }

    /// Filtered, paginated listing, newest first.
    pub async fn list(&self, query: ListQuery) -> Result<ReadingPage, IngestError> {
        let page_size = clamp_limit(query.limit, DEFAULT_PAGE_SIZE);
        let current_page = query.page.unwrap_or(1).max(1);

        let total_records = self.store.count(&query.filter).await?;
        let pagination = Pagination::new(current_page, page_size, total_records);

        let data = self
            .store
            .find(&query.filter, SortOrder::NewestFirst, pagination.offset(), page_size)
            .await?;

        Ok(ReadingPage { data, pagination })
    }

    /// Per (sensor, kind) aggregates, optionally for one sensor only.
    pub async fn statistics(&self, sensor_id: Option<&str>) -> Result<Vec<ReadingStats>, IngestError> {
        let filter = ReadingFilter {
            sensor_id: sensor_id.map(str::to_string),
            ..ReadingFilter::default()
        };
        let readings = self
            .store
            .find(&filter, SortOrder::OldestFirst, 0, usize::MAX)
            .await?;

        Ok(aggregate(&readings))
    }
}

#[async_trait]
impl ReadingSink for Ingestor {
    async fn submit(&self, reading: NewReading) -> Result<Reading, IngestError> {
        self.ingest(reading).await
    }
}

/// Sink used by server-side simulation jobs: always requires a known sensor.
pub struct SimulatorSink {
    ingestor: Arc<Ingestor>,
}

impl SimulatorSink {
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl ReadingSink for SimulatorSink {
    async fn submit(&self, reading: NewReading) -> Result<Reading, IngestError> {
        self.ingestor.ingest_with(reading, SensorCheck::Exists).await
    }
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, MAX_PAGE_SIZE)
}

fn aggregate(readings: &[Reading]) -> Vec<ReadingStats> {
    let mut groups: BTreeMap<(String, ReadingKind), ReadingStats> = BTreeMap::new();
    let mut sums: BTreeMap<(String, ReadingKind), f64> = BTreeMap::new();

    for reading in readings {
        let key = (reading.sensor_id.clone(), reading.tipo);
        *sums.entry(key.clone()).or_insert(0.0) += reading.valor;

        groups
            .entry(key)
            .and_modify(|stats| {
                stats.total += 1;
                stats.minimo = stats.minimo.min(reading.valor);
                stats.maximo = stats.maximo.max(reading.valor);
                if reading.fecha_hora > stats.ultima_lectura {
                    stats.ultima_lectura = reading.fecha_hora;
                }
            })
            .or_insert_with(|| ReadingStats {
                sensor_id: reading.sensor_id.clone(),
                tipo: reading.tipo,
                ultima_lectura: reading.fecha_hora,
                promedio: 0.0,
                minimo: reading.valor,
                maximo: reading.valor,
                total: 1,
            });
    }

    groups
        .into_iter()
        .map(|(key, mut stats)| {
            let sum = sums.get(&key).copied().unwrap_or(0.0);
            stats.promedio = (sum / stats.total as f64 * 100.0).round() / 100.0;
            stats
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Sensor;
    use crate::store::{MemorySensorRegistry, MemoryStore};
    use chrono::{Duration, TimeZone};

    fn ingestor_with(sensors: Vec<Sensor>) -> (Arc<MemoryStore>, Ingestor) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemorySensorRegistry::new(sensors));
        let ingestor = Ingestor::new(store.clone(), registry);
        (store, ingestor)
    }

    fn humidity(valor: f64) -> NewReading {
        NewReading::new("s1", ReadingKind::Humidity, valor)
    }

    #[tokio::test]
    async fn test_humidity_bounds() {
        let (store, ingestor) = ingestor_with(vec![]);

        let err = ingestor.ingest(humidity(150.0)).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(!err.is_transient());

        let stored = ingestor.ingest(humidity(55.0)).await.unwrap();
        assert_eq!(stored.valor, 55.0);
        assert_eq!(stored.unidad, "%");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_temperature_bounds_are_configurable() {
        let (_, ingestor) = ingestor_with(vec![]);
        let hot = NewReading::new("s1", ReadingKind::Temperature, 85.0);
        assert!(ingestor.ingest(hot.clone()).await.is_ok());
        assert!(ingestor
            .ingest(NewReading::new("s1", ReadingKind::Temperature, -51.0))
            .await
            .is_err());

        let strict = ingestor.with_temperature_bounds(ValueBounds { min: -50.0, max: 70.0 });
        assert!(matches!(strict.ingest(hot).await, Err(IngestError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let (store, ingestor) = ingestor_with(vec![]);

        let no_sensor = NewReading {
            sensor_id: Some("  ".to_string()),
            ..humidity(50.0)
        };
        let no_tipo = NewReading {
            tipo: None,
            ..humidity(50.0)
        };
        let bad_tipo = NewReading {
            tipo: Some("presion".to_string()),
            ..humidity(50.0)
        };
        let no_valor = NewReading {
            valor: None,
            ..humidity(50.0)
        };
        let nan = humidity(f64::NAN);

        for submission in [no_sensor, no_tipo, bad_tipo, no_valor, nan] {
            let err = ingestor.ingest(submission).await.unwrap_err();
            assert!(matches!(err, IngestError::Validation(_)), "{:?}", err);
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_defaults_timestamp_and_unit() {
        let (_, ingestor) = ingestor_with(vec![]);
        let before = Utc::now();

        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let submission = NewReading {
            unidad: None,
            fecha_hora: Some(epoch),
            ..NewReading::new("s1", ReadingKind::Temperature, 21.0)
        };
        let stored = ingestor.ingest(submission).await.unwrap();
        assert!(stored.fecha_hora >= before);
        assert_eq!(stored.unidad, "°C");

        let observed = Utc::now() - Duration::hours(1);
        let stored = ingestor
            .ingest(NewReading::new("s1", ReadingKind::Temperature, 21.0).at(observed))
            .await
            .unwrap();
        assert_eq!(stored.fecha_hora, observed);
    }

    #[tokio::test]
    async fn test_sensor_check_policies() {
        let (store, ingestor) = ingestor_with(vec![
            Sensor::new("s1", "humedad"),
            Sensor::new("off", "humedad").with_estado("inactivo"),
        ]);

        // Public path: unknown sensors are accepted
        let unknown = NewReading::new("ghost", ReadingKind::Humidity, 50.0);
        assert!(ingestor.ingest(unknown.clone()).await.is_ok());

        let err = ingestor.ingest_with(unknown, SensorCheck::Exists).await.unwrap_err();
        assert_eq!(err, IngestError::NotFound("ghost".to_string()));

        let inactive = NewReading::new("off", ReadingKind::Humidity, 50.0);
        assert!(ingestor.ingest_with(inactive.clone(), SensorCheck::Exists).await.is_ok());
        assert!(matches!(
            ingestor.ingest_with(inactive, SensorCheck::ExistsAndActive).await,
            Err(IngestError::NotFound(_))
        ));

        assert!(ingestor.ingest_with(humidity(50.0), SensorCheck::ExistsAndActive).await.is_ok());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_storage_outage_is_transient() {
        let (store, ingestor) = ingestor_with(vec![]);
        store.set_available(false);

        let err = ingestor.ingest(humidity(50.0)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_insert_appends_without_dedup() {
        let (store, ingestor) = ingestor_with(vec![]);
        let at = Utc::now();

        ingestor.ingest(humidity(50.0).at(at)).await.unwrap();
        ingestor.ingest(humidity(50.0).at(at)).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let (_, ingestor) = ingestor_with(vec![]);
        let base = Utc::now();
        // Record n is n minutes old, so newest-first order is 1, 2, 3, ...
        for n in 1..=25 {
            ingestor
                .ingest(humidity(n as f64).at(base - Duration::minutes(n)))
                .await
                .unwrap();
        }

        let page = ingestor
            .list(ListQuery {
                filter: ReadingFilter::default(),
                page: Some(2),
                limit: Some(10),
            })
            .await
            .unwrap();

        assert_eq!(page.pagination, Pagination {
            current_page: 2,
            total_pages: 3,
            total_records: 25,
            page_size: 10,
        });
        let values: Vec<f64> = page.data.iter().map(|r| r.valor).collect();
        let expected: Vec<f64> = (11..=20).map(|n| n as f64).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_list_clamps_arguments() {
        let (_, ingestor) = ingestor_with(vec![]);
        ingestor.ingest(humidity(50.0)).await.unwrap();

        let page = ingestor
            .list(ListQuery {
                filter: ReadingFilter::default(),
                page: Some(0),
                limit: Some(1_000),
            })
            .await
            .unwrap();
        assert_eq!(page.pagination.current_page, 1);
        assert_eq!(page.pagination.page_size, MAX_PAGE_SIZE);

        let empty = ingestor.list(ListQuery::default()).await.unwrap();
        assert_eq!(empty.pagination.page_size, DEFAULT_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_latest_clamps_limit() {
        let (_, ingestor) = ingestor_with(vec![]);
        for n in 0..5 {
            ingestor.ingest(humidity(40.0 + n as f64)).await.unwrap();
        }
        ingestor
            .ingest(NewReading::new("other", ReadingKind::Humidity, 10.0))
            .await
            .unwrap();

        assert_eq!(ingestor.latest("s1", Some(0)).await.unwrap().len(), 1);
        assert_eq!(ingestor.latest("s1", Some(3)).await.unwrap().len(), 3);
        assert_eq!(ingestor.latest("s1", None).await.unwrap().len(), 5);
        assert!(ingestor.latest("s1", None).await.unwrap().iter().all(|r| r.sensor_id == "s1"));
    }

    #[tokio::test]
    async fn test_statistics_grouping() {
        let (_, ingestor) = ingestor_with(vec![]);
        let base = Utc::now();
        for (i, valor) in [20.0, 22.0, 27.0].iter().enumerate() {
            ingestor
                .ingest(NewReading::new("s1", ReadingKind::Temperature, *valor).at(base - Duration::minutes(i as i64)))
                .await
                .unwrap();
        }
        ingestor.ingest(humidity(50.0).at(base)).await.unwrap();
        ingestor
            .ingest(NewReading::new("s2", ReadingKind::Humidity, 60.0))
            .await
            .unwrap();

        let all = ingestor.statistics(None).await.unwrap();
        assert_eq!(all.len(), 3);

        let s1 = ingestor.statistics(Some("s1")).await.unwrap();
        assert_eq!(s1.len(), 2);
        let temperature = &s1[0];
        assert_eq!(temperature.tipo, ReadingKind::Temperature);
        assert_eq!(temperature.total, 3);
        assert_eq!(temperature.minimo, 20.0);
        assert_eq!(temperature.maximo, 27.0);
        assert_eq!(temperature.promedio, 23.0);
        assert_eq!(temperature.ultima_lectura, base);
    }

    #[test]
    fn test_sensor_check_from_str() {
        assert_eq!("none".parse::<SensorCheck>(), Ok(SensorCheck::None));
        assert_eq!("Exists".parse::<SensorCheck>(), Ok(SensorCheck::Exists));
        assert_eq!("active".parse::<SensorCheck>(), Ok(SensorCheck::ExistsAndActive));
        assert!("maybe".parse::<SensorCheck>().is_err());
    }

    #[test]
    fn test_pagination_math() {
        assert_eq!(Pagination::new(1, 10, 0).total_pages, 0);
        assert_eq!(Pagination::new(1, 10, 10).total_pages, 1);
        assert_eq!(Pagination::new(3, 10, 25).offset(), 20);
        assert_eq!(Pagination::new(usize::MAX, 10, 25).offset(), usize::MAX);
        assert_eq!(Pagination::new(0, 10, 25).offset(), 0);
    }

    #[tokio::test]
    async fn test_list_far_past_last_page_is_empty() {
        let (_, ingestor) = ingestor_with(vec![]);
        for n in 0..3 {
            ingestor.ingest(humidity(40.0 + n as f64)).await.unwrap();
        }

        let page = ingestor
            .list(ListQuery {
                filter: ReadingFilter::default(),
                page: Some(usize::MAX),
                limit: Some(10),
            })
            .await
            .unwrap();

        assert!(page.data.is_empty());
        assert_eq!(page.pagination.current_page, usize::MAX);
        assert_eq!(page.pagination.total_records, 3);
    }
}
