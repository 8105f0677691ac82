use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::model::{OutcomeStatus, RunSummary, SkipReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
        }
    }
}

/// `RUST_LOG` wins over the verbosity flags.
pub fn init_tracing(verbosity: Verbosity) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| verbosity.filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Logs the per-series outcomes and totals of a run.
pub fn log_summary(summary: &RunSummary) {
    for outcome in &summary.outcomes {
        match &outcome.status {
            OutcomeStatus::Written => tracing::debug!(
                series = %outcome.id,
                fetched = outcome.samples_fetched,
                written = outcome.samples_written,
                "written"
            ),
            OutcomeStatus::Skipped(SkipReason::Unmapped) => {
                tracing::debug!(series = %outcome.id, "skipped (unmapped)")
            }
            OutcomeStatus::Skipped(reason) => {
                tracing::warn!(series = %outcome.id, reason = ?reason, "skipped")
            }
            OutcomeStatus::Failed(reason) => tracing::warn!(
                series = %outcome.id,
                written = outcome.samples_written,
                "failed: {}",
                reason
            ),
        }
    }

    tracing::info!(
        attempted = summary.attempted,
        skipped_unmapped = summary.skipped_unmapped,
        skipped_error = summary.skipped_error,
        failed = summary.failed,
        points_written = summary.points_written,
        "Import finished"
    );
}
