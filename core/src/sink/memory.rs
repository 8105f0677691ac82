use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::errors::SinkError;
use crate::model::{DatabasePoint, PointKey, RawValue};
use crate::sink::PointSink;

/// In-process destination with the same overwrite-by-key semantics as the
/// real database. Backs `--dry-run`.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<BTreeMap<PointKey, RawValue>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct points stored.
    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of points received, including overwrites.
    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }

    pub fn get(&self, key: &PointKey) -> Option<RawValue> {
        self.points.lock().ok()?.get(key).cloned()
    }
}

impl PointSink for MemorySink {
    async fn write_points(&self, points: &[DatabasePoint]) -> Result<(), SinkError> {
        let mut stored = self.points.lock().map_err(|_| SinkError::Unavailable {
            reason: "memory sink poisoned".to_string(),
        })?;
        for point in points {
            stored.insert(point.key(), point.value.clone());
        }
        drop(stored);

        if let Ok(mut writes) = self.writes.lock() {
            *writes += points.len();
        }
        Ok(())
    }
}
