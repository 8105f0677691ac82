use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::config::InfluxConfig;
use crate::errors::SinkError;
use crate::model::{DatabasePoint, RawValue};
use crate::sink::PointSink;

const FIELD_KEY: &str = "value";

static DROPPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"dropped=(\d+)").expect("Invalid dropped count regex"));

/// InfluxDB 1.x destination using the `/write` line-protocol endpoint with
/// second precision.
pub struct InfluxSink {
    http: reqwest::Client,
    config: InfluxConfig,
}

#[derive(Debug, Deserialize)]
struct InfluxErrorBody {
    error: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SinkError::Unavailable {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Checks that the server answers `/ping` before any work is done.
    pub async fn health_check(&self) -> Result<(), SinkError> {
        let url = format!(
            "{}://{}:{}/ping",
            self.config.scheme, self.config.host, self.config.port
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable {
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(SinkError::Unavailable {
                reason: format!("ping returned HTTP {}", resp.status()),
            });
        }

        info!("InfluxDB at {} is reachable", url);
        Ok(())
    }
}

impl PointSink for InfluxSink {
    async fn write_points(&self, points: &[DatabasePoint]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut request = self
            .http
            .post(self.config.write_url())
            .query(&[("db", self.config.database.as_str()), ("precision", "s")])
            .body(encode_points(points));

        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let resp = request.send().await.map_err(|e| SinkError::Unavailable {
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_success() {
            debug!("Wrote {} points to {}", points.len(), self.config.database);
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<InfluxErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(SinkError::Unavailable {
                    reason: format!("HTTP {}: {}", status, reason),
                })
            }
            status if status.is_server_error() => Err(SinkError::Unavailable {
                reason: format!("HTTP {}: {}", status, reason),
            }),
            _ => Err(SinkError::Rejected {
                accepted: points.len().saturating_sub(dropped_points(&reason, points.len())),
                reason,
            }),
        }
    }
}

/// Number of points InfluxDB reports as dropped in a `partial write` error;
/// the whole batch for any other rejection.
fn dropped_points(reason: &str, batch_len: usize) -> usize {
    if !reason.starts_with("partial write") {
        return batch_len;
    }

    DROPPED
        .captures_iter(reason)
        .last()
        .and_then(|caps| caps[1].parse::<usize>().ok())
        .unwrap_or(batch_len)
}

/// Renders points as line protocol, one line per point. Tags are written in
/// key order.
pub fn encode_points(points: &[DatabasePoint]) -> String {
    points.iter().map(encode_point).collect()
}

fn encode_point(point: &DatabasePoint) -> String {
    let mut line = escape(&point.measurement, &[',', ' ']);
    for (key, value) in &point.tags {
        line.push_str(&format!(
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        ));
    }

    let field = match &point.value {
        RawValue::Numeric(v) => v.to_string(),
        RawValue::Enumerated(s) => format!("\"{}\"", escape(s, &['"'])),
    };
    line.push_str(&format!(
        " {}={} {}\n",
        FIELD_KEY,
        field,
        point.timestamp.timestamp()
    ));
    line
}

fn escape(text: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
