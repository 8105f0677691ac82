use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use import_core::ingestor::Importer;
use import_core::mapping::MappingResolver;
use import_core::model::SeriesDescriptor;
use import_core::sink::PointSink;
use import_core::sink::influx::InfluxSink;
use import_core::sink::memory::MemorySink;
use import_core::source::StatsSource;
use import_core::source::miniserver::MiniserverClient;
use import_core::telemetry::{self, Verbosity};

/// Runs one import of controller statistics into InfluxDB and exits.
///
/// Scheduling is left to the host (cron, systemd timers). Re-running is safe:
/// every point is written under the same key each time.
#[derive(Parser)]
#[command(
    name = "stats-import",
    version,
    about = "Import Miniserver statistics into InfluxDB"
)]
struct Cli {
    /// Configuration file (YAML or JSON). Falls back to $IMPORT_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<String>,
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the series the controller offers and how they are mapped.
    List,
    /// Import every mapped series (default).
    Import(ImportArgs),
}

#[derive(Args, Default)]
struct ImportArgs {
    /// Only import samples at or after this instant (RFC 3339).
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// Write into memory instead of InfluxDB and report what would be written.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl Cli {
    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbosity());

    let config = import_core::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let resolver = MappingResolver::from_stats_map(&config.stats_map);
    let source = MiniserverClient::new(&config.miniserver)?;

    match cli.command.unwrap_or(Commands::Import(ImportArgs::default())) {
        Commands::List => list(&source, &resolver).await,
        Commands::Import(args) if args.dry_run => {
            let sink = MemorySink::new();
            let importer = Importer::from_config(&source, &sink, &resolver, &config);
            import(&importer, args.since).await?;
            info!(
                points = sink.len(),
                writes = sink.writes(),
                "Dry run, nothing written to InfluxDB"
            );
            Ok(())
        }
        Commands::Import(args) => {
            let sink = InfluxSink::new(&config.influxdb)?;
            sink.health_check()
                .await
                .context("InfluxDB is not reachable")?;
            let importer = Importer::from_config(&source, &sink, &resolver, &config);
            import(&importer, args.since).await
        }
    }
}

/// Runs one import. Only a systemic failure is an error; skipped and failed
/// series are reported in the summary.
async fn import<C: StatsSource, S: PointSink>(
    importer: &Importer<'_, C, S>,
    since: Option<DateTime<Utc>>,
) -> Result<()> {
    if let Some(since) = since {
        info!("Importing samples since {}", since);
    }

    match importer.run(since).await {
        Ok(summary) => {
            telemetry::log_summary(&summary);
            Ok(())
        }
        Err(aborted) => {
            telemetry::log_summary(&aborted.summary);
            Err(aborted.into())
        }
    }
}

async fn list<C: StatsSource>(source: &C, resolver: &MappingResolver) -> Result<()> {
    let series = source.list_series().await?;

    print!("{}", render_table(&series, resolver));
    Ok(())
}

fn render_table(series: &[SeriesDescriptor], resolver: &MappingResolver) -> String {
    let rows: Vec<[String; 4]> = series
        .iter()
        .map(|s| {
            let mapping = resolver
                .resolve(&s.id)
                .map(|rule| rule.measurement.clone())
                .unwrap_or_else(|| "-".to_string());
            [
                s.id.to_string(),
                s.title.clone(),
                s.files.len().to_string(),
                mapping,
            ]
        })
        .collect();

    let header = ["ID", "TITLE", "FILES", "MEASUREMENT"].map(String::from);
    let mut widths = header.clone().map(|h| h.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in std::iter::once(&header).chain(&rows) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}
