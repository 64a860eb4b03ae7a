//! Durable storage for device events.
//!
//! Provides SQLite connection pooling (via `r2d2`), idempotent schema
//! creation, and the upsert gateway that records the latest value per
//! `(device_id, param)` pair.
//!
//! # Design decisions
//!
//! - **One row per `(device_id, param)`**: enforced by a `UNIQUE` constraint
//!   and written with `INSERT ... ON CONFLICT DO UPDATE`, so repeated events
//!   update in place and never duplicate.
//! - **Schema owned here**: the table and its index are created with
//!   `IF NOT EXISTS` inside every write. A database file that is replaced or
//!   wiped while the process runs is recreated on the next event.
//! - **Scoped connections**: every gateway call checks a connection out of
//!   the pool and returns it on drop. The pool keeps no minimum of idle
//!   connections, so a storage outage fails only the calls made during it.

mod devices;
mod error;
mod gateway;
mod pool;
mod schema;

pub use devices::{count_records, get_record, records_for_device, upsert_event, DeviceRecord};
pub use error::DbError;
pub use gateway::PersistenceGateway;
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use schema::ensure_schema;
