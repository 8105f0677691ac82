use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;
use tracing::debug;

use crate::errors::PayloadError;
use crate::model::{RawPayload, RawSample, RawValue};

const SAMPLE_ELEMENT: &str = "S";
const TIME_ATTRIBUTE: &str = "T";
const VALUE_ATTRIBUTE: &str = "V";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Distinct samples at or after `since`, sorted by timestamp.
    pub samples: Vec<RawSample>,
    /// Every sample element read from the payload, duplicates included.
    pub total: usize,
}

/// Decodes every page of a stats payload into samples sorted by timestamp.
///
/// Pages are read in order. When a timestamp appears more than once the last
/// occurrence wins, which also covers boundary samples repeated across pages.
/// Samples before `payload.since` are dropped.
pub fn decode(payload: &RawPayload, utc_offset: FixedOffset) -> Result<Decoded, PayloadError> {
    let mut samples: BTreeMap<DateTime<Utc>, RawValue> = BTreeMap::new();
    let mut total = 0usize;

    for page in &payload.pages {
        for sample in decode_page(page, utc_offset)? {
            total += 1;
            samples.insert(sample.timestamp, sample.value);
        }
    }

    let kept: Vec<RawSample> = samples
        .into_iter()
        .filter(|(timestamp, _)| payload.since.is_none_or(|since| *timestamp >= since))
        .map(|(timestamp, value)| RawSample { timestamp, value })
        .collect();

    debug!(
        series = %payload.id,
        pages = payload.pages.len(),
        samples = total,
        kept = kept.len(),
        "Decoded stats payload"
    );
    Ok(Decoded {
        samples: kept,
        total,
    })
}

/// Samples of one stats file in document order.
fn decode_page(page: &[u8], utc_offset: FixedOffset) -> Result<Vec<RawSample>, PayloadError> {
    let text = std::str::from_utf8(page).map_err(|e| PayloadError::Malformed {
        reason: format!("payload is not valid UTF-8: {}", e),
    })?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut samples = Vec::new();
    let mut saw_element = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                saw_element = true;
                if e.name().as_ref() == SAMPLE_ELEMENT.as_bytes() {
                    samples.push(parse_sample(&e, utc_offset)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_element {
        return Err(PayloadError::Malformed {
            reason: "payload contains no XML elements".to_string(),
        });
    }
    Ok(samples)
}

fn parse_sample(element: &BytesStart, utc_offset: FixedOffset) -> Result<RawSample, PayloadError> {
    let mut time: Option<String> = None;
    let mut value: Option<String> = None;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| PayloadError::Malformed {
            reason: format!("invalid sample attribute: {}", e),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let text = attr
            .unescape_value()
            .map_err(PayloadError::from)?
            .to_string();

        match key.as_str() {
            TIME_ATTRIBUTE => time = Some(text),
            VALUE_ATTRIBUTE => value = Some(text),
            _ => {}
        }
    }

    let time = time.ok_or_else(|| PayloadError::Malformed {
        reason: "sample without time attribute".to_string(),
    })?;
    let value = value.ok_or_else(|| PayloadError::Malformed {
        reason: format!("sample at {} without value attribute", time),
    })?;

    Ok(RawSample {
        timestamp: parse_timestamp(&time, utc_offset)?,
        value: parse_value(&value)?,
    })
}

fn parse_timestamp(text: &str, utc_offset: FixedOffset) -> Result<DateTime<Utc>, PayloadError> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT).map_err(|e| {
        PayloadError::Malformed {
            reason: format!("invalid timestamp '{}': {}", text, e),
        }
    })?;

    utc_offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| PayloadError::Malformed {
            reason: format!("timestamp '{}' out of range", text),
        })
}

/// Numbers become `Numeric`; bare state words such as `on` become `Enumerated`.
fn parse_value(text: &str) -> Result<RawValue, PayloadError> {
    let text = text.trim();
    if let Ok(number) = text.parse::<f64>() {
        if number.is_finite() {
            return Ok(RawValue::Numeric(number));
        }
    }

    let is_word = text
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if is_word {
        return Ok(RawValue::Enumerated(text.to_string()));
    }

    Err(PayloadError::Malformed {
        reason: format!("invalid sample value '{}'", text),
    })
}
