//! Core domain model and identity resolution for joblake.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "joblake-core";

/// One posting as returned by the search API.
///
/// The source guarantees nothing: any field may be absent or carry a
/// surprising shape (numeric ids, stringly salaries, numeric area elements).
/// All lossy coercion happens here at the serde boundary so downstream code
/// only ever sees typed optionals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    #[serde(deserialize_with = "de_lossy_string")]
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created: Option<String>,
    pub company: Option<RawCompany>,
    pub location: Option<RawLocation>,
    pub category: Option<RawCategory>,
    #[serde(deserialize_with = "de_lossy_f64")]
    pub salary_min: Option<f64>,
    #[serde(deserialize_with = "de_lossy_f64")]
    pub salary_max: Option<f64>,
    pub contract_type: Option<String>,
    pub contract_time: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCompany {
    pub display_name: Option<String>,
}

/// Location sub-object: a variable-length `area` path ordered coarse to fine
/// (country, state, city, ...) plus a flat display name fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLocation {
    pub display_name: Option<String>,
    #[serde(deserialize_with = "de_lossy_string_vec")]
    pub area: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCategory {
    pub label: Option<String>,
}

fn coerce_scalar_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_lossy_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(coerce_scalar_string))
}

fn de_lossy_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }))
}

fn de_lossy_string_vec<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Array(items) => Some(
            items
                .into_iter()
                .map(|item| coerce_scalar_string(item).unwrap_or_default())
                .collect(),
        ),
        _ => None,
    }))
}

/// Trimmed non-empty text, or nothing.
pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Stable dedupe key for one posting.
///
/// The API-native id wins when present (returned unchanged). Otherwise the
/// key is the SHA-256 hex digest of trimmed title + company display name +
/// location display name, each defaulted to "". Two postings identical in
/// those three fields collapse to one identity even when description or
/// created differ; that trade-off is deliberate.
pub fn stable_job_id(record: &RawRecord) -> String {
    if let Some(id) = record.id.as_deref() {
        if !id.trim().is_empty() {
            return id.to_string();
        }
    }

    let title = record.title.as_deref().unwrap_or("").trim();
    let company = record
        .company
        .as_ref()
        .and_then(|c| c.display_name.as_deref())
        .unwrap_or("")
        .trim();
    let location = record
        .location
        .as_ref()
        .and_then(|l| l.display_name.as_deref())
        .unwrap_or("")
        .trim();

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(company.as_bytes());
    hasher.update(location.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalized job-fact row. `ingest_date` doubles as the partition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub created: Option<DateTime<Utc>>,
    pub redirect_url: Option<String>,
    pub ingest_ts: DateTime<Utc>,
    pub ingest_date: NaiveDate,
}

/// One row per posting; joins on job_id, not on company identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRow {
    pub job_id: String,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRow {
    pub job_id: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRow {
    pub job_id: String,
    pub category_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatsRow {
    pub job_id: String,
    pub contract_type: Option<String>,
    pub contract_time: Option<String>,
    pub posting_week: Option<u32>,
}

/// One transform batch, positionally aligned: row i of every table derives
/// from the i-th input record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableBatch {
    pub jobs: Vec<JobRow>,
    pub companies: Vec<CompanyRow>,
    pub locations: Vec<LocationRow>,
    pub categories: Vec<CategoryRow>,
    pub job_stats: Vec<JobStatsRow>,
}

impl TableBatch {
    pub fn record_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
