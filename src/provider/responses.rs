//! Wire shapes of the camera-cloud media API.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Response from `/media/search`.
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(rename = "_embedded", default)]
    pub embedded: SearchEmbedded,
    #[serde(rename = "_pages", default)]
    pub pages: Option<Pages>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchEmbedded {
    #[serde(default)]
    pub media: Vec<MediaEntry>,
}

#[derive(Debug, Deserialize)]
pub struct Pages {
    #[serde(default)]
    pub current_page: Option<u32>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub total_items: Option<u64>,
}

/// One catalog entry. Numeric fields arrive as numbers or strings depending
/// on API version, so they are kept dynamic and normalized on access.
#[derive(Debug, Deserialize)]
pub struct MediaEntry {
    pub id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub file_size: Value,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub captured_at: Option<String>,
    #[serde(default)]
    pub duration: Value,
    #[serde(default)]
    pub source_duration: Value,
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
}

impl MediaEntry {
    pub fn size_bytes(&self) -> Option<u64> {
        value_as_u64(&self.file_size)
    }

    /// Duration in milliseconds; `source_duration` wins when both exist.
    pub fn duration_ms(&self) -> Option<u64> {
        value_as_u64(&self.source_duration).or_else(|| value_as_u64(&self.duration))
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
            .as_deref()
            .or(self.created_at.as_deref())
            .and_then(parse_timestamp)
    }
}

/// Response from `/media/{id}/download`.
#[derive(Debug, Deserialize)]
pub struct DownloadResponse {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(rename = "_embedded", default)]
    pub embedded: DownloadEmbedded,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadEmbedded {
    #[serde(default)]
    pub files: Vec<DownloadVariant>,
    #[serde(default)]
    pub variations: Vec<DownloadVariant>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadVariant {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl DownloadResponse {
    /// Reference URL for the original-quality file: a variation labelled
    /// `label`, then a file with that label, then the first file with a URL.
    pub fn reference_url(&self, label: &str) -> Option<&str> {
        let labelled = |v: &&DownloadVariant| v.label.as_deref() == Some(label) && v.url.is_some();
        self.embedded
            .variations
            .iter()
            .find(labelled)
            .or_else(|| self.embedded.files.iter().find(labelled))
            .or_else(|| self.embedded.files.iter().find(|f| f.url.is_some()))
            .and_then(|v| v.url.as_deref())
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
