//! Sensor history and the latest-snapshot seam.
//!
//! The control engine only ever asks one question of the sensor pipeline:
//! *what is the most recent reading?*  [`SensorSnapshotProvider`] is that
//! question.  Producers (the sensor bridge, an operator typing a handheld
//! meter reading) write snapshots with `record`; the engine never mutates
//! them.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use hydros_types::{HydroError, SensorSnapshot};
use rusqlite::{OptionalExtension, params};

use crate::db::{Database, encode_ts};
use crate::error::StoreError;

/// Source of the most recent [`SensorSnapshot`].
#[async_trait]
pub trait SensorSnapshotProvider: Send + Sync {
    /// The newest snapshot, or `None` when nothing has been recorded yet.
    ///
    /// # Errors
    ///
    /// [`HydroError::StorageUnavailable`] when the backing store cannot be read.
    async fn latest(&self) -> Result<Option<SensorSnapshot>, HydroError>;
}

/// SQLite-backed history over the `sensor_readings` table.
#[derive(Clone)]
pub struct SqliteSensorHistory {
    db: Database,
}

impl SqliteSensorHistory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a snapshot.
    pub async fn record(&self, snapshot: &SensorSnapshot) -> Result<(), HydroError> {
        let ts = encode_ts(&snapshot.timestamp);
        let payload = serde_json::to_string(snapshot).map_err(StoreError::from)?;
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO sensor_readings (timestamp, payload) VALUES (?1, ?2)",
                    params![ts, payload],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Up to `limit` snapshots, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<SensorSnapshot>, HydroError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let snapshots = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT payload FROM sensor_readings
                     ORDER BY timestamp DESC, seq DESC
                     LIMIT ?1",
                )?;
                let payloads = stmt
                    .query_map(params![limit], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                payloads
                    .iter()
                    .map(|p| serde_json::from_str(p).map_err(StoreError::from))
                    .collect::<Result<Vec<SensorSnapshot>, StoreError>>()
            })
            .await?;
        Ok(snapshots)
    }
}

#[async_trait]
impl SensorSnapshotProvider for SqliteSensorHistory {
    async fn latest(&self) -> Result<Option<SensorSnapshot>, HydroError> {
        let snapshot: Option<SensorSnapshot> = self
            .db
            .run(|conn| {
                let payload: Option<String> = conn
                    .query_row(
                        "SELECT payload FROM sensor_readings
                         ORDER BY timestamp DESC, seq DESC
                         LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                match payload {
                    Some(p) => Ok(Some(serde_json::from_str(&p)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(snapshot)
    }
}

/// In-process provider holding only the latest reading.
#[derive(Default)]
pub struct LatestReading {
    snapshot: RwLock<Option<SensorSnapshot>>,
}

impl LatestReading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: SensorSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
        }
    }

    /// Replace the current reading.
    pub fn record(&self, snapshot: SensorSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }
}

#[async_trait]
impl SensorSnapshotProvider for LatestReading {
    async fn latest(&self) -> Result<Option<SensorSnapshot>, HydroError> {
        Ok(self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn history() -> SqliteSensorHistory {
        SqliteSensorHistory::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn latest_is_none_when_empty() {
        assert!(history().latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_returns_newest_by_timestamp() {
        let h = history();
        let mut newer = SensorSnapshot::new().with_water_level(80.0);
        let mut older = SensorSnapshot::new().with_water_level(10.0);
        newer.timestamp = Utc::now();
        older.timestamp = newer.timestamp - Duration::minutes(5);

        // Recorded out of order: a late-arriving old reading must not win.
        h.record(&newer).await.unwrap();
        h.record(&older).await.unwrap();

        let latest = h.latest().await.unwrap().unwrap();
        assert_eq!(latest.water_level, Some(80.0));
    }

    #[tokio::test]
    async fn snapshot_round_trips_all_fields() {
        let h = history();
        let mut snap = SensorSnapshot::new();
        for field in SensorSnapshot::FIELDS {
            snap.set(field, 1.0).unwrap();
        }
        h.record(&snap).await.unwrap();
        let back = h.latest().await.unwrap().unwrap();
        assert_eq!(back.ph, Some(1.0));
        assert_eq!(back.gas_detected, Some(true));
        assert_eq!(back.timestamp, snap.timestamp);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let h = history();
        let base = Utc::now();
        for i in 0..3 {
            let mut s = SensorSnapshot::new().with_water_level(f64::from(i));
            s.timestamp = base + Duration::seconds(i64::from(i));
            h.record(&s).await.unwrap();
        }
        let levels: Vec<Option<f64>> = h
            .history(2)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.water_level)
            .collect();
        assert_eq!(levels, [Some(2.0), Some(1.0)]);
    }

    #[tokio::test]
    async fn latest_reading_replaces_previous() {
        let r = LatestReading::new();
        assert!(r.latest().await.unwrap().is_none());
        r.record(SensorSnapshot::new().with_water_level(50.0));
        r.record(SensorSnapshot::new().with_water_level(12.0));
        assert_eq!(r.latest().await.unwrap().unwrap().water_level, Some(12.0));
    }
}
