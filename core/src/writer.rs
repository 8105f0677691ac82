use tracing::{debug, warn};

use crate::errors::SinkError;
use crate::model::{DatabasePoint, MappingRule, RawSample};
use crate::sink::PointSink;

/// A write that stopped early. `written` counts every point stored before the
/// failure, including the accepted part of the rejected batch.
#[derive(Debug)]
pub struct WriteFailure {
    pub written: usize,
    pub error: SinkError,
}

/// Turns samples into points for one mapping rule and writes them in bounded
/// batches.
///
/// Re-running over the same samples writes the same keys again, and the
/// destination overwrites them, so no bookkeeping of earlier runs is needed.
pub struct IdempotentWriter<'a, S: PointSink> {
    sink: &'a S,
    batch_size: usize,
}

impl<'a, S: PointSink> IdempotentWriter<'a, S> {
    pub fn new(sink: &'a S, batch_size: usize) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
        }
    }

    /// Writes batches sequentially and stops at the first failing one without
    /// retrying it.
    pub async fn write(&self, rule: &MappingRule, samples: &[RawSample]) -> Result<usize, WriteFailure> {
        let mut written = 0;

        for chunk in samples.chunks(self.batch_size) {
            let points: Vec<DatabasePoint> = chunk
                .iter()
                .map(|sample| DatabasePoint::from_sample(rule, sample))
                .collect();

            match self.sink.write_points(&points).await {
                Ok(()) => {
                    written += points.len();
                    debug!(
                        measurement = %rule.measurement,
                        batch = points.len(),
                        written,
                        "Batch written"
                    );
                }
                Err(SinkError::Rejected { accepted, reason }) => {
                    let accepted = accepted.min(points.len());
                    warn!(
                        measurement = %rule.measurement,
                        accepted,
                        batch = points.len(),
                        "Batch rejected: {}",
                        reason
                    );
                    return Err(WriteFailure {
                        written: written + accepted,
                        error: SinkError::Rejected { accepted, reason },
                    });
                }
                Err(error) => return Err(WriteFailure { written, error }),
            }
        }

        Ok(written)
    }
}
