//! Reading and sensor records.
//!
//! Field names on the wire keep the dashboard's camelCase Spanish schema
//! (`sensorId`, `tipo`, `valor`, `unidad`, `fechaHora`) so existing clients and
//! stored documents stay compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Estado value of a sensor that is in service.
pub const SENSOR_ACTIVE: &str = "activo";

/// Physical quantity measured by a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReadingKind {
    #[serde(rename = "temperatura")]
    Temperature,
    #[serde(rename = "humedad")]
    Humidity,
}

impl ReadingKind {
    /// Get all reading kinds.
    pub fn all() -> &'static [ReadingKind] {
        &[ReadingKind::Temperature, ReadingKind::Humidity]
    }

    /// Name used in the `tipo` field.
    pub fn name(&self) -> &'static str {
        match self {
            ReadingKind::Temperature => "temperatura",
            ReadingKind::Humidity => "humedad",
        }
    }

    /// Display unit paired with this kind.
    pub fn unit(&self) -> &'static str {
        match self {
            ReadingKind::Temperature => "°C",
            ReadingKind::Humidity => "%",
        }
    }

    /// Parse a `tipo` value. Accepts the Spanish and English names, any case.
    pub fn parse(tipo: &str) -> Option<Self> {
        match tipo.trim().to_lowercase().as_str() {
            "temperatura" | "temperature" => Some(ReadingKind::Temperature),
            "humedad" | "humidity" => Some(ReadingKind::Humidity),
            _ => None,
        }
    }

    /// Kind a sensor of the given free-text type produces, if it is not mixed.
    ///
    /// Matches by substring so values like "Temperatura ambiente" or
    /// "sensor de humedad" resolve.
    pub fn for_sensor_type(sensor_tipo: &str) -> Option<Self> {
        let tipo = sensor_tipo.to_lowercase();
        if tipo.contains("temperatura") || tipo.contains("temperature") {
            Some(ReadingKind::Temperature)
        } else if tipo.contains("humedad") || tipo.contains("humidity") {
            Some(ReadingKind::Humidity)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored sensor measurement. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Server-assigned identifier
    pub id: String,

    pub sensor_id: String,

    /// Moment the value was observed
    pub fecha_hora: DateTime<Utc>,

    pub tipo: ReadingKind,

    pub valor: f64,

    pub unidad: String,
}

/// A reading as submitted to the ingestion sink, before validation.
///
/// Every field is optional so that shape errors surface as validation
/// failures with a useful message instead of a body rejection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tipo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valor: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unidad: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_hora: Option<DateTime<Utc>>,
}

impl NewReading {
    /// Build a complete submission for a generated value.
    pub fn new(sensor_id: impl Into<String>, kind: ReadingKind, valor: f64) -> Self {
        Self {
            sensor_id: Some(sensor_id.into()),
            tipo: Some(kind.name().to_string()),
            valor: Some(valor),
            unidad: Some(kind.unit().to_string()),
            fecha_hora: Some(Utc::now()),
        }
    }

    /// Override the observation time.
    pub fn at(mut self, fecha_hora: DateTime<Utc>) -> Self {
        self.fecha_hora = Some(fecha_hora);
        self
    }
}

/// A sensor registered in a huerto zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: String,

    #[serde(default)]
    pub zona_id: String,

    /// Free-text type, e.g. "temperatura", "humedad", "mixto"
    pub tipo: String,

    #[serde(default)]
    pub modelo: String,

    #[serde(default = "default_estado")]
    pub estado: String,

    #[serde(default = "Utc::now")]
    pub fecha_instalacion: DateTime<Utc>,

    #[serde(default)]
    pub descripcion: String,
}

fn default_estado() -> String {
    SENSOR_ACTIVE.to_string()
}

impl Sensor {
    /// Create an active sensor with the given id and type.
    pub fn new(id: impl Into<String>, tipo: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            zona_id: String::new(),
            tipo: tipo.into(),
            modelo: String::new(),
            estado: default_estado(),
            fecha_instalacion: Utc::now(),
            descripcion: String::new(),
        }
    }

    /// Set the estado field.
    pub fn with_estado(mut self, estado: impl Into<String>) -> Self {
        self.estado = estado.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.estado.eq_ignore_ascii_case(SENSOR_ACTIVE)
    }
}

/// Generate a fresh reading identifier.
pub fn new_reading_id() -> String {
    Uuid::new_v4().to_string()
}
