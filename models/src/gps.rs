use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Latest known position for a modem. One row per (modem_id, provider).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct ModemGps {
    pub modem_id: String,
    pub provider: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single GPS fix as served to API consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GpsFix {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

impl From<&ModemGps> for GpsFix {
    fn from(record: &ModemGps) -> Self {
        GpsFix {
            timestamp: record.timestamp,
            lat: record.latitude,
            lon: record.longitude,
        }
    }
}
