pub mod influx;
pub mod memory;

use crate::errors::SinkError;
use crate::model::DatabasePoint;

/// The `PointSink` trait defines the contract for any destination database.
///
/// A destination must overwrite a stored point when a new one arrives with the
/// same measurement, tag set and timestamp; this is what makes re-running an
/// import over an overlapping window safe.
#[allow(async_fn_in_trait)]
pub trait PointSink {
    /// Persists one batch. On `SinkError::Rejected` the `accepted` count tells
    /// how many points of this batch were stored before the rejection.
    async fn write_points(&self, points: &[DatabasePoint]) -> Result<(), SinkError>;
}
