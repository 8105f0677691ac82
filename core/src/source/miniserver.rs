use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MiniserverConfig;
use crate::errors::ControllerError;
use crate::model::{RawPayload, SeriesDescriptor, SeriesId, StatsFile};
use crate::source::StatsSource;

const STATS_PATH: &str = "stats";
const DEFAULT_FORMAT: &str = "xml";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s+href="([^"]*)"[^>]*>(.*?)</a>"#).expect("Invalid link regex")
});

// Link texts end with the month of the file, e.g. "Living room 02-2024".
static MONTH_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\d{2}-\d{4}$").expect("Invalid month suffix regex"));

/// Statistics source backed by the Miniserver's `/stats/` HTTP listing.
pub struct MiniserverClient {
    http: reqwest::Client,
    config: MiniserverConfig,
}

impl MiniserverClient {
    pub fn new(config: &MiniserverConfig) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ControllerError::Unavailable {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// GETs `path` below the Miniserver root. `Ok(None)` means HTTP 404.
    ///
    /// Timeouts, connection failures and 5xx responses are retried with
    /// exponential backoff; once `max_retries` is exhausted the controller is
    /// reported unavailable. Rejected credentials are never retried.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ControllerError> {
        let url = format!("{}/{}", self.config.base_url(), path);
        let mut delay = self.config.retry_delay();
        let mut attempt = 0u32;

        loop {
            let response = self
                .http
                .get(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .send()
                .await;

            let reason = match response {
                Ok(resp) => match resp.status() {
                    status if status.is_success() => match resp.bytes().await {
                        Ok(body) => {
                            debug!("Fetched {} ({} bytes)", url, body.len());
                            return Ok(Some(body.to_vec()));
                        }
                        Err(e) => format!("failed to read response body: {}", e),
                    },
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        return Err(ControllerError::AuthFailed {
                            status: resp.status().as_u16(),
                        });
                    }
                    StatusCode::NOT_FOUND => return Ok(None),
                    status if status.is_server_error() => format!("HTTP {}", status),
                    status => {
                        return Err(ControllerError::Unavailable {
                            reason: format!("unexpected HTTP {} for {}", status, url),
                        });
                    }
                },
                Err(e) => e.to_string(),
            };

            if attempt >= self.config.max_retries {
                return Err(ControllerError::Unavailable {
                    reason: format!("{} failed after {} attempts: {}", url, attempt + 1, reason),
                });
            }
            attempt += 1;
            warn!(
                "Request to {} failed ({}), retrying in {:?} (attempt {}/{})",
                url, reason, delay, attempt, self.config.max_retries
            );
            tokio::time::sleep(delay).await;
            delay = next_delay(delay);
        }
    }
}

/// Doubles the backoff delay, capped at `MAX_RETRY_DELAY`.
fn next_delay(delay: Duration) -> Duration {
    delay.saturating_mul(2).min(MAX_RETRY_DELAY)
}

impl StatsSource for MiniserverClient {
    async fn list_series(&self) -> Result<Vec<SeriesDescriptor>, ControllerError> {
        let body = self
            .get(&format!("{}/", STATS_PATH))
            .await?
            .ok_or_else(|| ControllerError::Unavailable {
                reason: "stats listing not found on controller".to_string(),
            })?;

        let series = parse_listing(&String::from_utf8_lossy(&body));
        info!("Controller lists {} stats series", series.len());
        Ok(series)
    }

    async fn fetch(
        &self,
        series: &SeriesDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<RawPayload, ControllerError> {
        if series.files.is_empty() {
            return Err(ControllerError::SeriesNotFound {
                id: series.id.clone(),
            });
        }

        let files: Vec<&StatsFile> = series
            .files
            .iter()
            .filter(|file| since.is_none_or(|since| file.may_contain_since(since)))
            .collect();

        let mut pages = Vec::with_capacity(files.len());
        for file in files {
            let page = self
                .get(&format!("{}/{}", STATS_PATH, file.name))
                .await?
                .ok_or_else(|| ControllerError::SeriesNotFound {
                    id: series.id.clone(),
                })?;
            pages.push(page);
        }

        debug!(
            series = %series.id,
            files = series.files.len(),
            fetched = pages.len(),
            "Fetched stats files"
        );

        Ok(RawPayload {
            id: series.id.clone(),
            pages,
            since,
        })
    }
}

/// Groups the `<a href="FILE">TITLE</a>` links of a stats listing into one
/// descriptor per series, in first-seen order, with files sorted by month.
/// The title is the link text without its trailing `MM-YYYY`.
pub fn parse_listing(html: &str) -> Vec<SeriesDescriptor> {
    let mut series: Vec<SeriesDescriptor> = Vec::new();
    let mut index: HashMap<SeriesId, usize> = HashMap::new();

    for (href, text) in links(html) {
        let Some(id) = SeriesId::from_file_name(&href) else {
            continue;
        };

        let position = *index.entry(id.clone()).or_insert_with(|| {
            let format = href
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string())
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
            let title = MONTH_SUFFIX.replace(&text, "");
            let title = if title.is_empty() {
                id.to_string()
            } else {
                title.into_owned()
            };
            series.push(SeriesDescriptor {
                id: id.clone(),
                title,
                format,
                files: Vec::new(),
            });
            series.len() - 1
        });
        series[position].files.push(StatsFile::new(href));
    }

    for descriptor in &mut series {
        descriptor
            .files
            .sort_by(|a, b| (a.period, &a.name).cmp(&(b.period, &b.name)));
    }
    series
}

fn links(html: &str) -> Vec<(String, String)> {
    LINK.captures_iter(html)
        .map(|caps| (caps[1].trim().to_string(), caps[2].trim().to_string()))
        .collect()
}
