pub mod miniserver;

use chrono::{DateTime, Utc};

use crate::errors::ControllerError;
use crate::model::{RawPayload, SeriesDescriptor};

/// A controller that records statistics, regardless of whether it's a
/// Miniserver, a test double, etc.
#[allow(async_fn_in_trait)]
pub trait StatsSource {
    /// Lists every series the controller currently records.
    ///
    /// Always asks the controller; the set changes whenever the automation
    /// project is edited.
    async fn list_series(&self) -> Result<Vec<SeriesDescriptor>, ControllerError>;

    /// Retrieves the undecoded statistics of one series.
    ///
    /// Without `since` the full history is returned. With it, the payload is
    /// restricted to samples at or after that instant.
    async fn fetch(
        &self,
        series: &SeriesDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<RawPayload, ControllerError>;
}
