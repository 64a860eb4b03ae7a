//! The persistence gateway used by the event pipeline.

use hmbridge_types::DeviceEvent;

use crate::devices::{records_for_device, upsert_event, DeviceRecord};
use crate::error::DbError;
use crate::pool::DbPool;
use crate::schema::ensure_schema;

/// Idempotent upsert of device events into durable storage.
///
/// Each call is an independent unit of work: check out a connection, make
/// sure the schema exists, write, and hand the connection back. The calls
/// block; async callers should run them on a blocking thread.
#[derive(Clone)]
pub struct PersistenceGateway {
    pool: DbPool,
}

impl PersistenceGateway {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Writes the event. Failures are logged and reported as `false`.
    pub fn upsert(&self, event: &DeviceEvent) -> bool {
        match self.try_upsert(event) {
            Ok(()) => {
                tracing::debug!(
                    device_id = %event.device_id,
                    param = %event.param,
                    "event upserted into storage"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    device_id = %event.device_id,
                    param = %event.param,
                    error = %e,
                    "failed to upsert event into storage"
                );
                false
            }
        }
    }

    /// Writes the event, returning the error to the caller.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Unavailable` if no connection can be obtained and
    /// `DbError::Query` if a statement fails.
    pub fn try_upsert(&self, event: &DeviceEvent) -> Result<(), DbError> {
        let conn = self.pool.get()?;
        ensure_schema(&conn)?;
        upsert_event(&conn, event)?;
        Ok(())
    }

    /// Lists persisted rows for the physical device behind `device_id`.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the pool or the query fails.
    pub fn records_for_device(&self, device_id: &str) -> Result<Vec<DeviceRecord>, DbError> {
        let conn = self.pool.get()?;
        ensure_schema(&conn)?;
        Ok(records_for_device(&conn, device_id)?)
    }
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("max_size", &self.pool.max_size())
            .finish()
    }
}
