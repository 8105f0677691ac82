use chrono::{DateTime, FixedOffset, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ImportConfig, ProcessingConfig};
use crate::decoder;
use crate::errors::{ImportError, PayloadError};
use crate::mapping::MappingResolver;
use crate::model::{OutcomeStatus, RunSummary, SeriesDescriptor, SeriesOutcome, SkipReason};
use crate::sink::PointSink;
use crate::source::StatsSource;
use crate::writer::IdempotentWriter;

/// A run stopped by a systemic error. `summary` holds the outcomes of every
/// series that finished before the stop.
#[derive(Error, Debug)]
#[error("Import aborted: {cause}")]
pub struct RunAborted {
    pub summary: RunSummary,
    #[source]
    pub cause: ImportError,
}

type SeriesResult = (SeriesOutcome, Option<ImportError>);

/// The importer orchestrates the data flow controller -> decoder -> mapping ->
/// destination for every series of one run.
pub struct Importer<'a, C: StatsSource, S: PointSink> {
    source: &'a C,
    sink: &'a S,
    resolver: &'a MappingResolver,
    processing: ProcessingConfig,
    utc_offset: FixedOffset,
}

impl<'a, C: StatsSource, S: PointSink> Importer<'a, C, S> {
    pub fn new(
        source: &'a C,
        sink: &'a S,
        resolver: &'a MappingResolver,
        processing: ProcessingConfig,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            source,
            sink,
            resolver,
            processing,
            utc_offset,
        }
    }

    pub fn from_config(
        source: &'a C,
        sink: &'a S,
        resolver: &'a MappingResolver,
        config: &ImportConfig,
    ) -> Self {
        Self::new(
            source,
            sink,
            resolver,
            config.processing.clone(),
            config.miniserver.utc_offset(),
        )
    }

    /// Lists the controller's series and imports all of them.
    ///
    /// Mapped series the controller does not list are reported as
    /// `Skipped(NotFound)` after the listed ones.
    pub async fn run(&self, since: Option<DateTime<Utc>>) -> Result<RunSummary, RunAborted> {
        info!("Getting list of stats series from controller");
        let catalog = self.source.list_series().await.map_err(|e| RunAborted {
            summary: RunSummary::default(),
            cause: e.into(),
        })?;

        let listed: HashSet<_> = catalog.iter().map(|s| &s.id).collect();
        let mut unlisted: Vec<SeriesOutcome> = self
            .resolver
            .ids()
            .filter(|id| !listed.contains(id))
            .map(|id| {
                warn!(series = %id, "Mapped stats series is not listed by the controller");
                SeriesOutcome::skipped(id.clone(), SkipReason::NotFound)
            })
            .collect();
        unlisted.sort_by(|a, b| a.id.cmp(&b.id));

        match self.run_import(&catalog, since).await {
            Ok(summary) => Ok(append_outcomes(summary, unlisted)),
            Err(aborted) => Err(RunAborted {
                summary: append_outcomes(aborted.summary, unlisted),
                cause: aborted.cause,
            }),
        }
    }

    /// Imports `series` with bounded concurrency.
    ///
    /// Per-series errors end up in that series' outcome. A systemic error
    /// keeps not-yet-started series from starting, lets in-flight ones finish
    /// and is returned as `RunAborted`. Outcomes follow the order of `series`.
    pub async fn run_import(
        &self,
        series: &[SeriesDescriptor],
        since: Option<DateTime<Utc>>,
    ) -> Result<RunSummary, RunAborted> {
        info!(
            "{} stats series to import (concurrency {})",
            series.len(),
            self.processing.concurrency
        );

        let abort = AtomicBool::new(false);
        let abort = &abort;

        let mut results: Vec<(usize, SeriesResult)> = stream::iter(series.iter().enumerate())
            .map(|(index, descriptor)| async move {
                self.import_series(descriptor, since, abort)
                    .await
                    .map(|result| (index, result))
            })
            .buffer_unordered(self.processing.concurrency.max(1))
            .filter_map(|result| async move { result })
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut cause = None;
        let mut outcomes = Vec::with_capacity(results.len());
        for (_, (outcome, systemic)) in results {
            if cause.is_none() {
                cause = systemic;
            }
            outcomes.push(outcome);
        }

        let summary = RunSummary::from_outcomes(outcomes);
        match cause {
            Some(cause) => Err(RunAborted { summary, cause }),
            None => Ok(summary),
        }
    }

    /// `None` when the run was aborted before this series started.
    async fn import_series(
        &self,
        series: &SeriesDescriptor,
        since: Option<DateTime<Utc>>,
        abort: &AtomicBool,
    ) -> Option<SeriesResult> {
        let id = &series.id;
        if abort.load(Ordering::SeqCst) {
            debug!(series = %id, "Run aborted, not starting series");
            return None;
        }

        let Some(rule) = self.resolver.resolve(id) else {
            warn!(series = %id, "Stats series not mapped, skipping");
            return Some((SeriesOutcome::skipped(id.clone(), SkipReason::Unmapped), None));
        };

        info!(
            series = %id,
            measurement = %rule.measurement,
            tags = ?rule.tags,
            "Importing '{}'",
            series.title
        );

        let payload = match self.source.fetch(series, since).await {
            Ok(payload) => payload,
            Err(e) => return Some(self.settle(series, 0, 0, e.into(), abort)),
        };

        let decoded = match decoder::decode(&payload, self.utc_offset) {
            Ok(decoded) => decoded,
            Err(e) => return Some(self.settle(series, 0, 0, e.into(), abort)),
        };

        let writer = IdempotentWriter::new(self.sink, self.processing.batch_size);
        match writer.write(rule, &decoded.samples).await {
            Ok(written) => {
                info!(series = %id, written, "Data written");
                Some((
                    SeriesOutcome {
                        id: id.clone(),
                        samples_fetched: decoded.total,
                        samples_written: written,
                        status: OutcomeStatus::Written,
                    },
                    None,
                ))
            }
            Err(failure) => Some(self.settle(
                series,
                decoded.total,
                failure.written,
                failure.error.into(),
                abort,
            )),
        }
    }

    /// Folds a series error into its outcome, raising the abort flag for
    /// systemic errors.
    fn settle(
        &self,
        series: &SeriesDescriptor,
        fetched: usize,
        written: usize,
        error: ImportError,
        abort: &AtomicBool,
    ) -> SeriesResult {
        let id = series.id.clone();

        if error.should_skip_series() {
            warn!(series = %id, error = %error, "Skipping series");
            let reason = match &error {
                ImportError::Payload(PayloadError::Malformed { reason }) => {
                    SkipReason::MalformedPayload(reason.clone())
                }
                _ => SkipReason::NotFound,
            };
            let outcome = SeriesOutcome {
                id,
                samples_fetched: fetched,
                samples_written: written,
                status: OutcomeStatus::Skipped(reason),
            };
            return (outcome, None);
        }

        let outcome = SeriesOutcome {
            id,
            samples_fetched: fetched,
            samples_written: written,
            status: OutcomeStatus::Failed(error.to_string()),
        };

        if error.is_systemic() {
            abort.store(true, Ordering::SeqCst);
            error!(series = %outcome.id, error = %error, "Systemic failure, stopping the run");
            (outcome, Some(error))
        } else {
            error!(series = %outcome.id, error = %error, written, "Series import failed");
            (outcome, None)
        }
    }
}

fn append_outcomes(summary: RunSummary, extra: Vec<SeriesOutcome>) -> RunSummary {
    if extra.is_empty() {
        return summary;
    }
    let mut outcomes = summary.outcomes;
    outcomes.extend(extra);
    RunSummary::from_outcomes(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ControllerError, SinkError};
    use crate::model::{DatabasePoint, MappingRule, RawPayload, SeriesId, StatsFile};
    use crate::sink::memory::MemorySink;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum FakeResponse {
        Xml(String),
        NotFound,
        Unavailable,
        AuthFailed,
    }

    #[derive(Default)]
    struct FakeSource {
        series: Vec<SeriesDescriptor>,
        responses: HashMap<SeriesId, FakeResponse>,
        delays: HashMap<SeriesId, Duration>,
        auth_failed: bool,
        fetched: Mutex<Vec<(SeriesId, Option<DateTime<Utc>>)>>,
    }

    impl FakeSource {
        fn with(mut self, id: &str, response: FakeResponse) -> Self {
            self.series.push(SeriesDescriptor {
                id: SeriesId::new(id),
                title: format!("Series {}", id),
                format: "xml".to_string(),
                files: vec![StatsFile::new(format!("{}.202401.xml", id))],
            });
            self.responses.insert(SeriesId::new(id), response);
            self
        }

        /// Makes `fetch` of `id` take `millis` before answering.
        fn delayed(mut self, id: &str, millis: u64) -> Self {
            self.delays
                .insert(SeriesId::new(id), Duration::from_millis(millis));
            self
        }

        fn fetched_ids(&self) -> Vec<SeriesId> {
            self.fetched
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    impl StatsSource for FakeSource {
        async fn list_series(&self) -> Result<Vec<SeriesDescriptor>, ControllerError> {
            if self.auth_failed {
                return Err(ControllerError::AuthFailed { status: 401 });
            }
            Ok(self.series.clone())
        }

        async fn fetch(
            &self,
            series: &SeriesDescriptor,
            since: Option<DateTime<Utc>>,
        ) -> Result<RawPayload, ControllerError> {
            self.fetched
                .lock()
                .unwrap()
                .push((series.id.clone(), since));

            if let Some(delay) = self.delays.get(&series.id) {
                tokio::time::sleep(*delay).await;
            }

            match self.responses.get(&series.id) {
                Some(FakeResponse::Xml(xml)) => Ok(RawPayload {
                    id: series.id.clone(),
                    pages: vec![xml.as_bytes().to_vec()],
                    since,
                }),
                Some(FakeResponse::Unavailable) => Err(ControllerError::Unavailable {
                    reason: "connection refused".to_string(),
                }),
                Some(FakeResponse::AuthFailed) => Err(ControllerError::AuthFailed { status: 403 }),
                _ => Err(ControllerError::SeriesNotFound {
                    id: series.id.clone(),
                }),
            }
        }
    }

    /// Rejects every batch for one measurement, accepting the first `accepted`.
    struct PickySink {
        inner: MemorySink,
        rejected_measurement: String,
        accepted: usize,
    }

    impl PointSink for PickySink {
        async fn write_points(&self, points: &[DatabasePoint]) -> Result<(), SinkError> {
            if points.iter().any(|p| p.measurement == self.rejected_measurement) {
                self.inner.write_points(&points[..self.accepted]).await?;
                return Err(SinkError::Rejected {
                    accepted: self.accepted,
                    reason: "field type conflict".to_string(),
                });
            }
            self.inner.write_points(points).await
        }
    }

    fn xml(samples: &[(&str, &str)]) -> FakeResponse {
        let body: String = samples
            .iter()
            .map(|(t, v)| format!(r#"<S T="{}" V="{}"/>"#, t, v))
            .collect();
        FakeResponse::Xml(format!("<Statistics Name=\"test\">{}</Statistics>", body))
    }

    fn resolver(ids: &[&str]) -> MappingResolver {
        MappingResolver::new(ids.iter().map(|id| MappingRule {
            id: SeriesId::new(*id),
            measurement: format!("measurement_{}", id),
            tags: BTreeMap::from([("series".to_string(), id.to_string())]),
        }))
    }

    fn processing(concurrency: usize) -> ProcessingConfig {
        ProcessingConfig {
            batch_size: 2,
            concurrency,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn outcome<'s>(summary: &'s RunSummary, id: &str) -> &'s SeriesOutcome {
        summary
            .outcomes
            .iter()
            .find(|o| o.id.as_str() == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_mapped_and_unmapped_series() {
        let source = FakeSource::default()
            .with(
                "a",
                xml(&[
                    ("2024-01-01 00:00:00", "1.0"),
                    ("2024-01-01 01:00:00", "2.0"),
                    ("2024-01-01 00:00:00", "1.5"),
                ]),
            )
            .with("b", xml(&[("2024-01-01 00:00:00", "9")]));
        let sink = MemorySink::new();
        let resolver = resolver(&["a"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(2), utc());

        let summary = importer.run(None).await.unwrap();

        let a = outcome(&summary, "a");
        assert_eq!(a.samples_fetched, 3);
        assert_eq!(a.samples_written, 2);
        assert_eq!(a.status, OutcomeStatus::Written);

        let b = outcome(&summary, "b");
        assert_eq!(b.samples_written, 0);
        assert_eq!(b.status, OutcomeStatus::Skipped(SkipReason::Unmapped));

        assert_eq!(summary.skipped_unmapped, 1);
        assert_eq!(summary.points_written, 2);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_unmapped_series_is_never_fetched() {
        let source = FakeSource::default()
            .with("a", xml(&[("2024-01-01 00:00:00", "1")]))
            .with("b", xml(&[("2024-01-01 00:00:00", "2")]));
        let sink = MemorySink::new();
        let resolver = resolver(&["a"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        importer.run(None).await.unwrap();

        assert_eq!(source.fetched_ids(), vec![SeriesId::new("a")]);
    }

    #[tokio::test]
    async fn test_second_run_does_not_grow_destination() {
        let source = FakeSource::default().with(
            "a",
            xml(&[
                ("2024-01-01 00:00:00", "1"),
                ("2024-01-01 01:00:00", "2"),
                ("2024-01-01 02:00:00", "3"),
            ]),
        );
        let sink = MemorySink::new();
        let resolver = resolver(&["a"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let first = importer.run(None).await.unwrap();
        let stored_after_first = sink.len();
        let second = importer.run(None).await.unwrap();

        assert_eq!(first.points_written, second.points_written);
        assert_eq!(sink.len(), stored_after_first);
        assert_eq!(sink.writes(), 6);
    }

    #[tokio::test]
    async fn test_per_series_errors_do_not_stop_the_run() {
        let source = FakeSource::default()
            .with("a", FakeResponse::NotFound)
            .with("b", FakeResponse::Xml("<Statistics><S T=\"bad\" V=\"1\"/></Statistics>".to_string()))
            .with("c", xml(&[("2024-01-01 00:00:00", "1")]));
        let sink = MemorySink::new();
        let resolver = resolver(&["a", "b", "c"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let summary = importer.run(None).await.unwrap();

        assert_eq!(
            outcome(&summary, "a").status,
            OutcomeStatus::Skipped(SkipReason::NotFound)
        );
        assert!(matches!(
            outcome(&summary, "b").status,
            OutcomeStatus::Skipped(SkipReason::MalformedPayload(_))
        ));
        assert_eq!(outcome(&summary, "c").status, OutcomeStatus::Written);
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.skipped_error, 2);
        assert_eq!(summary.points_written, 1);
    }

    #[tokio::test]
    async fn test_write_rejection_records_partial_success() {
        let source = FakeSource::default()
            .with(
                "a",
                xml(&[
                    ("2024-01-01 00:00:00", "1"),
                    ("2024-01-01 01:00:00", "2"),
                ]),
            )
            .with("b", xml(&[("2024-01-01 00:00:00", "1")]));
        let sink = PickySink {
            inner: MemorySink::new(),
            rejected_measurement: "measurement_a".to_string(),
            accepted: 1,
        };
        let resolver = resolver(&["a", "b"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let summary = importer.run(None).await.unwrap();

        let a = outcome(&summary, "a");
        assert_eq!(a.samples_fetched, 2);
        assert_eq!(a.samples_written, 1);
        assert!(matches!(a.status, OutcomeStatus::Failed(_)));
        assert_eq!(outcome(&summary, "b").status, OutcomeStatus::Written);
        assert_eq!(summary.failed, 1);
        assert_eq!(sink.inner.len(), 2);
    }

    #[tokio::test]
    async fn test_controller_unavailable_aborts_and_keeps_outcomes() {
        let source = FakeSource::default()
            .with("a", xml(&[("2024-01-01 00:00:00", "1")]))
            .with("b", FakeResponse::Unavailable)
            .with("c", xml(&[("2024-01-01 00:00:00", "1")]));
        let sink = MemorySink::new();
        let resolver = resolver(&["a", "b", "c"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let aborted = importer.run(None).await.unwrap_err();

        assert!(aborted.cause.is_systemic());
        assert_eq!(aborted.summary.outcomes.len(), 2);
        assert_eq!(outcome(&aborted.summary, "a").status, OutcomeStatus::Written);
        assert!(matches!(
            outcome(&aborted.summary, "b").status,
            OutcomeStatus::Failed(_)
        ));
        assert!(!source.fetched_ids().contains(&SeriesId::new("c")));
    }

    #[tokio::test]
    async fn test_catalog_auth_failure_aborts_before_any_fetch() {
        let source = FakeSource {
            auth_failed: true,
            ..FakeSource::default()
        };
        let sink = MemorySink::new();
        let resolver = resolver(&["a"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let aborted = importer.run(None).await.unwrap_err();

        assert!(matches!(
            aborted.cause,
            ImportError::Controller(ControllerError::AuthFailed { status: 401 })
        ));
        assert!(aborted.summary.outcomes.is_empty());
        assert!(source.fetched_ids().is_empty());
    }

    #[tokio::test]
    async fn test_outcomes_follow_catalog_order_under_concurrency() {
        let mut source = FakeSource::default();
        let ids: Vec<String> = (0..8).map(|i| format!("{:x}", i + 10)).collect();
        for id in &ids {
            source = source.with(id, xml(&[("2024-01-01 00:00:00", "1")]));
        }
        let sink = MemorySink::new();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let resolver = resolver(&id_refs);
        let importer = Importer::new(&source, &sink, &resolver, processing(4), utc());

        let summary = importer.run(None).await.unwrap();

        let order: Vec<&str> = summary.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(order, id_refs);
        assert_eq!(summary.points_written, 8);
    }

    #[tokio::test]
    async fn test_since_is_passed_to_fetch_and_filters_samples() {
        let source = FakeSource::default().with(
            "a",
            xml(&[
                ("2024-01-01 00:00:00", "1"),
                ("2024-01-02 00:00:00", "2"),
            ]),
        );
        let sink = MemorySink::new();
        let resolver = resolver(&["a"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());
        let since = "2024-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let summary = importer.run(Some(since)).await.unwrap();

        assert_eq!(summary.points_written, 1);
        assert_eq!(source.fetched.lock().unwrap()[0].1, Some(since));
    }

    #[tokio::test]
    async fn test_mapped_series_missing_from_listing_is_not_found() {
        let source = FakeSource::default().with("a", xml(&[("2024-01-01 00:00:00", "1")]));
        let sink = MemorySink::new();
        let resolver = resolver(&["a", "gone"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let summary = importer.run(None).await.unwrap();

        let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "gone"]);
        assert_eq!(
            outcome(&summary, "gone").status,
            OutcomeStatus::Skipped(SkipReason::NotFound)
        );
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.skipped_error, 1);
        assert_eq!(source.fetched_ids(), vec![SeriesId::new("a")]);
    }

    #[tokio::test]
    async fn test_missing_mapped_series_reported_when_run_aborts() {
        let source = FakeSource::default().with("a", FakeResponse::Unavailable);
        let sink = MemorySink::new();
        let resolver = resolver(&["a", "gone"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let aborted = importer.run(None).await.unwrap_err();

        assert_eq!(
            outcome(&aborted.summary, "gone").status,
            OutcomeStatus::Skipped(SkipReason::NotFound)
        );
        assert_eq!(aborted.summary.failed, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_during_fetch_aborts() {
        let source = FakeSource::default()
            .with("a", xml(&[("2024-01-01 00:00:00", "1")]))
            .with("b", FakeResponse::AuthFailed)
            .with("c", xml(&[("2024-01-01 00:00:00", "1")]));
        let sink = MemorySink::new();
        let resolver = resolver(&["a", "b", "c"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(1), utc());

        let aborted = importer.run(None).await.unwrap_err();

        assert!(matches!(
            aborted.cause,
            ImportError::Controller(ControllerError::AuthFailed { status: 403 })
        ));
        assert_eq!(outcome(&aborted.summary, "a").status, OutcomeStatus::Written);
        assert!(matches!(
            outcome(&aborted.summary, "b").status,
            OutcomeStatus::Failed(_)
        ));
        assert_eq!(aborted.summary.outcomes.len(), 2);
        assert_eq!(
            source.fetched_ids(),
            vec![SeriesId::new("a"), SeriesId::new("b")]
        );
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_lets_in_flight_series_finish() {
        let source = FakeSource::default()
            .with(
                "a",
                xml(&[
                    ("2024-01-01 00:00:00", "1"),
                    ("2024-01-01 01:00:00", "2"),
                ]),
            )
            .with("b", FakeResponse::Unavailable)
            .with("c", xml(&[("2024-01-01 00:00:00", "1")]))
            .with("d", xml(&[("2024-01-01 00:00:00", "1")]))
            .delayed("a", 100)
            .delayed("b", 10);
        let sink = MemorySink::new();
        let resolver = resolver(&["a", "b", "c", "d"]);
        let importer = Importer::new(&source, &sink, &resolver, processing(2), utc());

        let aborted = importer.run(None).await.unwrap_err();

        assert!(aborted.cause.is_systemic());
        let ids: Vec<&str> = aborted.summary.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let a = outcome(&aborted.summary, "a");
        assert_eq!(a.status, OutcomeStatus::Written);
        assert_eq!(a.samples_written, 2);
        assert_eq!(sink.len(), 2);

        let fetched = source.fetched_ids();
        assert!(!fetched.contains(&SeriesId::new("c")));
        assert!(!fetched.contains(&SeriesId::new("d")));
    }
}
