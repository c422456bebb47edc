//! Ingest pipeline: normalize raw postings into five tables, merge-dedupe
//! against the persisted partition, publish parquet.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use joblake_core::{
    stable_job_id, text_or_none, CategoryRow, CompanyRow, JobRow, JobStatsRow, LocationRow,
    RawLocation, RawRecord, TableBatch,
};
use joblake_fetch::PageSource;
use joblake_storage::{raw_page_key, table_object_key, ObjectStore, Stage};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "joblake-ingest";

pub const ENV_DATA_DIR: &str = "JOBLAKE_DATA_DIR";
pub const ENV_ARCHIVE_RAW: &str = "JOBLAKE_ARCHIVE_RAW";

/// Local pipeline settings, built once at process start.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub archive_raw: bool,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup(ENV_DATA_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            archive_raw: lookup(ENV_ARCHIVE_RAW)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer / table splitter
// ---------------------------------------------------------------------------

/// Split one batch of raw records into the five derived tables.
///
/// Pure over `records` and `now`; `now` stamps `ingest_ts`/`ingest_date`
/// uniformly across the batch. Exactly one row per record lands in every
/// table — malformed nested fields degrade to nulls, never drop a row.
pub fn transform(records: &[RawRecord], now: DateTime<Utc>) -> TableBatch {
    let ingest_date = now.date_naive();
    let mut batch = TableBatch::default();

    for record in records {
        let job_id = stable_job_id(record);
        let created = record.created.as_deref().and_then(parse_timestamp);
        let (country, state, city) = parse_location(record.location.as_ref());

        batch.jobs.push(JobRow {
            job_id: job_id.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            salary_min: record.salary_min,
            salary_max: record.salary_max,
            created,
            redirect_url: record.redirect_url.clone(),
            ingest_ts: now,
            ingest_date,
        });

        batch.companies.push(CompanyRow {
            job_id: job_id.clone(),
            company_name: record
                .company
                .as_ref()
                .and_then(|c| c.display_name.clone()),
        });

        batch.locations.push(LocationRow {
            job_id: job_id.clone(),
            city,
            state,
            country,
        });

        batch.categories.push(CategoryRow {
            job_id: job_id.clone(),
            category_label: record.category.as_ref().and_then(|c| c.label.clone()),
        });

        batch.job_stats.push(JobStatsRow {
            job_id,
            contract_type: record.contract_type.clone(),
            contract_time: record.contract_time.clone(),
            posting_week: created.map(|t| t.iso_week().week()),
        });
    }

    batch
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Positional parse of the variable-length area path, coarse to fine:
/// index 0 = country, 1 = state, 2 = city; deeper elements are ignored.
/// An empty or absent path falls back to the flat display name for country.
fn parse_location(
    location: Option<&RawLocation>,
) -> (Option<String>, Option<String>, Option<String>) {
    let Some(location) = location else {
        return (None, None, None);
    };
    let area = location.area.as_deref().unwrap_or(&[]);
    if area.is_empty() {
        let country = location.display_name.as_deref().and_then(text_or_none);
        return (country, None, None);
    }
    let element = |index: usize| area.get(index).map(String::as_str).and_then(text_or_none);
    (element(0), element(1), element(2))
}

// ---------------------------------------------------------------------------
// Per-table parquet codec
// ---------------------------------------------------------------------------

/// A row type with a fixed destination table and arrow representation.
///
/// String-typed columns stay Utf8 even when a whole batch is null so the
/// destination schema cannot drift between null-heavy and populated days.
pub trait TableRow: Sized + Send {
    const TABLE: &'static str;

    fn job_id(&self) -> &str;
    fn schema() -> SchemaRef;
    fn to_batch(rows: &[Self]) -> Result<RecordBatch>;
    fn from_batch(batch: &RecordBatch, out: &mut Vec<Self>) -> Result<()>;
}

fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    let index = batch
        .schema()
        .index_of(name)
        .with_context(|| format!("missing column {name}"))?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {name} is not utf8"))
}

fn f64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    let index = batch
        .schema()
        .index_of(name)
        .with_context(|| format!("missing column {name}"))?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Float64Array>()
        .with_context(|| format!("column {name} is not float64"))
}

fn u32_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    let index = batch
        .schema()
        .index_of(name)
        .with_context(|| format!("missing column {name}"))?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<UInt32Array>()
        .with_context(|| format!("column {name} is not uint32"))
}

fn opt_str(array: &StringArray, i: usize) -> Option<String> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i).to_string())
    }
}

fn opt_f64(array: &Float64Array, i: usize) -> Option<f64> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i))
    }
}

fn opt_u32(array: &UInt32Array, i: usize) -> Option<u32> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i))
    }
}

fn string_values<I>(values: I) -> StringArray
where
    I: IntoIterator<Item = Option<String>>,
{
    values.into_iter().collect()
}

impl TableRow for JobRow {
    const TABLE: &'static str = "jobs";

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ArrowField::new("job_id", DataType::Utf8, false),
            ArrowField::new("title", DataType::Utf8, true),
            ArrowField::new("description", DataType::Utf8, true),
            ArrowField::new("salary_min", DataType::Float64, true),
            ArrowField::new("salary_max", DataType::Float64, true),
            ArrowField::new("created", DataType::Utf8, true),
            ArrowField::new("redirect_url", DataType::Utf8, true),
            ArrowField::new("ingest_ts", DataType::Utf8, false),
            ArrowField::new("ingest_date", DataType::Utf8, false),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let job_ids = string_values(rows.iter().map(|r| Some(r.job_id.clone())));
        let titles = string_values(rows.iter().map(|r| r.title.clone()));
        let descriptions = string_values(rows.iter().map(|r| r.description.clone()));
        let salary_min = Float64Array::from(rows.iter().map(|r| r.salary_min).collect::<Vec<_>>());
        let salary_max = Float64Array::from(rows.iter().map(|r| r.salary_max).collect::<Vec<_>>());
        let created = string_values(rows.iter().map(|r| r.created.map(|t| t.to_rfc3339())));
        let redirect_urls = string_values(rows.iter().map(|r| r.redirect_url.clone()));
        let ingest_ts = string_values(rows.iter().map(|r| Some(r.ingest_ts.to_rfc3339())));
        let ingest_date = string_values(rows.iter().map(|r| Some(r.ingest_date.to_string())));

        RecordBatch::try_new(
            Self::schema(),
            vec![
                Arc::new(job_ids),
                Arc::new(titles),
                Arc::new(descriptions),
                Arc::new(salary_min),
                Arc::new(salary_max),
                Arc::new(created),
                Arc::new(redirect_urls),
                Arc::new(ingest_ts),
                Arc::new(ingest_date),
            ],
        )
        .context("building jobs record batch")
    }

    fn from_batch(batch: &RecordBatch, out: &mut Vec<Self>) -> Result<()> {
        let job_ids = str_col(batch, "job_id")?;
        let titles = str_col(batch, "title")?;
        let descriptions = str_col(batch, "description")?;
        let salary_min = f64_col(batch, "salary_min")?;
        let salary_max = f64_col(batch, "salary_max")?;
        let created = str_col(batch, "created")?;
        let redirect_urls = str_col(batch, "redirect_url")?;
        let ingest_ts = str_col(batch, "ingest_ts")?;
        let ingest_dates = str_col(batch, "ingest_date")?;

        for i in 0..batch.num_rows() {
            let ts = parse_timestamp(ingest_ts.value(i))
                .with_context(|| format!("invalid ingest_ts {:?}", ingest_ts.value(i)))?;
            let date = ingest_dates
                .value(i)
                .parse::<NaiveDate>()
                .with_context(|| format!("invalid ingest_date {:?}", ingest_dates.value(i)))?;
            out.push(JobRow {
                job_id: job_ids.value(i).to_string(),
                title: opt_str(titles, i),
                description: opt_str(descriptions, i),
                salary_min: opt_f64(salary_min, i),
                salary_max: opt_f64(salary_max, i),
                created: opt_str(created, i).as_deref().and_then(parse_timestamp),
                redirect_url: opt_str(redirect_urls, i),
                ingest_ts: ts,
                ingest_date: date,
            });
        }
        Ok(())
    }
}

impl TableRow for CompanyRow {
    const TABLE: &'static str = "companies";

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ArrowField::new("job_id", DataType::Utf8, false),
            ArrowField::new("company_name", DataType::Utf8, true),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let job_ids = string_values(rows.iter().map(|r| Some(r.job_id.clone())));
        let names = string_values(rows.iter().map(|r| r.company_name.clone()));
        RecordBatch::try_new(Self::schema(), vec![Arc::new(job_ids), Arc::new(names)])
            .context("building companies record batch")
    }

    fn from_batch(batch: &RecordBatch, out: &mut Vec<Self>) -> Result<()> {
        let job_ids = str_col(batch, "job_id")?;
        let names = str_col(batch, "company_name")?;
        for i in 0..batch.num_rows() {
            out.push(CompanyRow {
                job_id: job_ids.value(i).to_string(),
                company_name: opt_str(names, i),
            });
        }
        Ok(())
    }
}

impl TableRow for LocationRow {
    const TABLE: &'static str = "locations";

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ArrowField::new("job_id", DataType::Utf8, false),
            ArrowField::new("city", DataType::Utf8, true),
            ArrowField::new("state", DataType::Utf8, true),
            ArrowField::new("country", DataType::Utf8, true),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let job_ids = string_values(rows.iter().map(|r| Some(r.job_id.clone())));
        let cities = string_values(rows.iter().map(|r| r.city.clone()));
        let states = string_values(rows.iter().map(|r| r.state.clone()));
        let countries = string_values(rows.iter().map(|r| r.country.clone()));
        RecordBatch::try_new(
            Self::schema(),
            vec![
                Arc::new(job_ids),
                Arc::new(cities),
                Arc::new(states),
                Arc::new(countries),
            ],
        )
        .context("building locations record batch")
    }

    fn from_batch(batch: &RecordBatch, out: &mut Vec<Self>) -> Result<()> {
        let job_ids = str_col(batch, "job_id")?;
        let cities = str_col(batch, "city")?;
        let states = str_col(batch, "state")?;
        let countries = str_col(batch, "country")?;
        for i in 0..batch.num_rows() {
            out.push(LocationRow {
                job_id: job_ids.value(i).to_string(),
                city: opt_str(cities, i),
                state: opt_str(states, i),
                country: opt_str(countries, i),
            });
        }
        Ok(())
    }
}

impl TableRow for CategoryRow {
    const TABLE: &'static str = "categories";

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ArrowField::new("job_id", DataType::Utf8, false),
            ArrowField::new("category_label", DataType::Utf8, true),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let job_ids = string_values(rows.iter().map(|r| Some(r.job_id.clone())));
        let labels = string_values(rows.iter().map(|r| r.category_label.clone()));
        RecordBatch::try_new(Self::schema(), vec![Arc::new(job_ids), Arc::new(labels)])
            .context("building categories record batch")
    }

    fn from_batch(batch: &RecordBatch, out: &mut Vec<Self>) -> Result<()> {
        let job_ids = str_col(batch, "job_id")?;
        let labels = str_col(batch, "category_label")?;
        for i in 0..batch.num_rows() {
            out.push(CategoryRow {
                job_id: job_ids.value(i).to_string(),
                category_label: opt_str(labels, i),
            });
        }
        Ok(())
    }
}

impl TableRow for JobStatsRow {
    const TABLE: &'static str = "job_stats";

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ArrowField::new("job_id", DataType::Utf8, false),
            ArrowField::new("contract_type", DataType::Utf8, true),
            ArrowField::new("contract_time", DataType::Utf8, true),
            ArrowField::new("posting_week", DataType::UInt32, true),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        let job_ids = string_values(rows.iter().map(|r| Some(r.job_id.clone())));
        let contract_types = string_values(rows.iter().map(|r| r.contract_type.clone()));
        let contract_times = string_values(rows.iter().map(|r| r.contract_time.clone()));
        let posting_weeks =
            UInt32Array::from(rows.iter().map(|r| r.posting_week).collect::<Vec<_>>());
        RecordBatch::try_new(
            Self::schema(),
            vec![
                Arc::new(job_ids),
                Arc::new(contract_types),
                Arc::new(contract_times),
                Arc::new(posting_weeks),
            ],
        )
        .context("building job_stats record batch")
    }

    fn from_batch(batch: &RecordBatch, out: &mut Vec<Self>) -> Result<()> {
        let job_ids = str_col(batch, "job_id")?;
        let contract_types = str_col(batch, "contract_type")?;
        let contract_times = str_col(batch, "contract_time")?;
        let posting_weeks = u32_col(batch, "posting_week")?;
        for i in 0..batch.num_rows() {
            out.push(JobStatsRow {
                job_id: job_ids.value(i).to_string(),
                contract_type: opt_str(contract_types, i),
                contract_time: opt_str(contract_times, i),
                posting_week: opt_u32(posting_weeks, i),
            });
        }
        Ok(())
    }
}

pub fn encode_parquet<R: TableRow>(rows: &[R]) -> Result<Vec<u8>> {
    let batch = R::to_batch(rows)?;
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {}", R::TABLE))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing {} record batch", R::TABLE))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer for {}", R::TABLE))?;
    Ok(buf)
}

pub fn decode_parquet<R: TableRow>(bytes: Vec<u8>) -> Result<Vec<R>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .with_context(|| format!("opening parquet reader for {}", R::TABLE))?
        .build()
        .with_context(|| format!("reading parquet for {}", R::TABLE))?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding {} record batch", R::TABLE))?;
        R::from_batch(&batch, &mut rows)?;
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Merge-dedupe partition writer
// ---------------------------------------------------------------------------

/// Union prior and new rows, keeping the last occurrence per job_id.
/// New rows follow existing ones, so a re-fetched posting overwrites its
/// stale copy in place while first-seen ordering is preserved.
pub fn merge_rows<R: TableRow>(existing: Vec<R>, new: Vec<R>) -> Vec<R> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<R> = Vec::with_capacity(existing.len() + new.len());
    for row in existing.into_iter().chain(new) {
        match index.entry(row.job_id().to_string()) {
            Entry::Occupied(slot) => merged[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(row);
            }
        }
    }
    merged
}

/// Read-modify-write of one table's partition: download the whole partition
/// (a missing object is an empty prior state, any other storage failure
/// propagates), merge, re-publish. Returns the persisted row count.
///
/// Not safe under concurrent writers; runs against one partition must be
/// serialized by the invoking scheduler.
pub async fn merge_write<R: TableRow>(
    store: &dyn ObjectStore,
    ingest_date: NaiveDate,
    new_rows: Vec<R>,
) -> Result<usize> {
    let key = table_object_key(Stage::Processed, R::TABLE, ingest_date);
    let existing = match store.get(&key).await {
        Ok(bytes) => decode_parquet::<R>(bytes)
            .with_context(|| format!("decoding existing partition {key}"))?,
        Err(err) if err.is_not_found() => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("reading partition {key}")),
    };

    let merged = merge_rows(existing, new_rows);
    let bytes =
        encode_parquet(&merged).with_context(|| format!("encoding partition {key}"))?;
    store
        .put(&key, &bytes)
        .await
        .with_context(|| format!("publishing partition {key}"))?;
    info!(table = R::TABLE, %ingest_date, rows = merged.len(), "merged partition");
    Ok(merged.len())
}

// ---------------------------------------------------------------------------
// Run orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub records_ingested: usize,
    pub partitions: Vec<NaiveDate>,
    pub persisted_rows: BTreeMap<String, usize>,
}

pub struct IngestPipeline {
    source: Box<dyn PageSource>,
    store: Box<dyn ObjectStore>,
    archive_raw: bool,
}

impl IngestPipeline {
    pub fn new(source: Box<dyn PageSource>, store: Box<dyn ObjectStore>) -> Self {
        Self {
            source,
            store,
            archive_raw: true,
        }
    }

    pub fn with_archive_raw(mut self, enabled: bool) -> Self {
        self.archive_raw = enabled;
        self
    }

    /// Drive fetch -> transform -> merge, page by page from page 1.
    ///
    /// Pagination stops at the first empty page or after `max_pages`; an
    /// empty page is a normal completion, not an error. Each page is merged
    /// into its partition before the next fetch, so pages already persisted
    /// survive a later page's failure.
    pub async fn run_ingestion(&self, max_pages: u32, per_page: u32) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut pages_fetched = 0usize;
        let mut records_ingested = 0usize;
        let mut partitions: Vec<NaiveDate> = Vec::new();
        let mut persisted_rows: BTreeMap<String, usize> = BTreeMap::new();

        for page in 1..=max_pages {
            let fetched = self
                .source
                .fetch_page(page, per_page)
                .await
                .with_context(|| format!("fetching page {page}"))?;
            if fetched.records.is_empty() {
                info!(%run_id, page, "empty page, pagination exhausted");
                break;
            }

            let now = Utc::now();
            let ingest_date = now.date_naive();

            if self.archive_raw {
                let key = raw_page_key(ingest_date, fetched.page);
                self.store
                    .put(&key, &fetched.body)
                    .await
                    .with_context(|| format!("archiving raw page {page}"))?;
            }

            let record_count = fetched.records.len();
            let batch = transform(&fetched.records, now);
            for (table, rows) in self.merge_batch(batch, ingest_date).await? {
                persisted_rows.insert(table, rows);
            }
            if !partitions.contains(&ingest_date) {
                partitions.push(ingest_date);
            }

            pages_fetched += 1;
            records_ingested += record_count;
            info!(%run_id, page, records = record_count, "page merged");
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            records_ingested,
            partitions,
            persisted_rows,
        })
    }

    async fn merge_batch(
        &self,
        batch: TableBatch,
        ingest_date: NaiveDate,
    ) -> Result<Vec<(String, usize)>> {
        let store = self.store.as_ref();
        Ok(vec![
            (
                JobRow::TABLE.to_string(),
                merge_write(store, ingest_date, batch.jobs).await?,
            ),
            (
                CompanyRow::TABLE.to_string(),
                merge_write(store, ingest_date, batch.companies).await?,
            ),
            (
                LocationRow::TABLE.to_string(),
                merge_write(store, ingest_date, batch.locations).await?,
            ),
            (
                CategoryRow::TABLE.to_string(),
                merge_write(store, ingest_date, batch.categories).await?,
            ),
            (
                JobStatsRow::TABLE.to_string(),
                merge_write(store, ingest_date, batch.job_stats).await?,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblake_fetch::{FetchError, FetchedPage};
    use joblake_storage::LocalObjectStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date")
    }

    fn now() -> DateTime<Utc> {
        "2026-08-06T09:30:00Z".parse().expect("timestamp")
    }

    fn sample_record(id: serde_json::Value) -> RawRecord {
        serde_json::from_value(json!({
            "id": id,
            "title": "Data Scientist",
            "description": "Machine learning and analytics role.",
            "company": {"display_name": "ACME Analytics"},
            "location": {"area": ["US", "California", "Pleasant Hill"]},
            "salary_min": 90000,
            "salary_max": 130000,
            "created": "2025-10-10T12:00:00Z",
            "redirect_url": "https://jobs.example.com/12345",
            "category": {"label": "Data Science"},
            "contract_type": "permanent",
            "contract_time": "full_time"
        }))
        .expect("sample record")
    }

    fn record_without_id(title: &str, company: &str, location: &str) -> RawRecord {
        serde_json::from_value(json!({
            "title": title,
            "company": {"display_name": company},
            "location": {"display_name": location},
        }))
        .expect("record")
    }

    #[test]
    fn transform_emits_one_row_per_record_per_table() {
        let records = vec![
            sample_record(json!("1")),
            sample_record(json!("2")),
            record_without_id("Data Analyst", "DataCorp", "Boston"),
        ];
        let batch = transform(&records, now());
        assert_eq!(batch.jobs.len(), 3);
        assert_eq!(batch.companies.len(), 3);
        assert_eq!(batch.locations.len(), 3);
        assert_eq!(batch.categories.len(), 3);
        assert_eq!(batch.job_stats.len(), 3);
        assert!(batch.jobs.iter().all(|r| r.ingest_ts == now()));
        assert!(batch.jobs.iter().all(|r| r.ingest_date == date("2026-08-06")));
    }

    #[test]
    fn transform_threads_the_identity_through_every_table() {
        let batch = transform(&[sample_record(json!("JOB123"))], now());
        assert_eq!(batch.jobs[0].job_id, "JOB123");
        assert_eq!(batch.companies[0].job_id, "JOB123");
        assert_eq!(batch.locations[0].job_id, "JOB123");
        assert_eq!(batch.categories[0].job_id, "JOB123");
        assert_eq!(batch.job_stats[0].job_id, "JOB123");
    }

    #[test]
    fn area_parsing_positions_are_coarse_to_fine() {
        let cases = [
            (json!(["US", "California", "Pleasant Hill"]),
             (Some("US"), Some("California"), Some("Pleasant Hill"))),
            (json!(["US", "California"]), (Some("US"), Some("California"), None)),
            (json!(["US"]), (Some("US"), None, None)),
            (json!([]), (None, None, None)),
        ];
        for (area, (country, state, city)) in cases {
            let record: RawRecord =
                serde_json::from_value(json!({"location": {"area": area.clone()}})).unwrap();
            let batch = transform(&[record], now());
            let row = &batch.locations[0];
            assert_eq!(row.country.as_deref(), country, "area={area}");
            assert_eq!(row.state.as_deref(), state, "area={area}");
            assert_eq!(row.city.as_deref(), city, "area={area}");
        }
    }

    #[test]
    fn deeper_area_hierarchies_keep_the_third_element_as_city() {
        let record: RawRecord = serde_json::from_value(
            json!({"location": {"area": ["US", "California", "Contra Costa County", "Pleasant Hill"]}}),
        )
        .unwrap();
        let batch = transform(&[record], now());
        assert_eq!(batch.locations[0].city.as_deref(), Some("Contra Costa County"));
    }

    #[test]
    fn empty_area_falls_back_to_display_name_for_country() {
        let record: RawRecord = serde_json::from_value(
            json!({"location": {"display_name": "Boston", "area": []}}),
        )
        .unwrap();
        let batch = transform(&[record], now());
        let row = &batch.locations[0];
        assert_eq!(row.country.as_deref(), Some("Boston"));
        assert_eq!(row.state, None);
        assert_eq!(row.city, None);
    }

    #[test]
    fn absent_location_yields_all_null_fields() {
        let record: RawRecord = serde_json::from_value(json!({"title": "Bare"})).unwrap();
        let batch = transform(&[record], now());
        let row = &batch.locations[0];
        assert_eq!((row.city.as_deref(), row.state.as_deref(), row.country.as_deref()),
                   (None, None, None));
    }

    #[test]
    fn stringly_salary_is_coerced_to_numeric() {
        let record: RawRecord = serde_json::from_value(
            json!({"id": "1", "salary_min": "90000", "salary_max": 130000}),
        )
        .unwrap();
        let batch = transform(&[record], now());
        assert_eq!(batch.jobs[0].salary_min, Some(90000.0));
        assert_eq!(batch.jobs[0].salary_max, Some(130000.0));
    }

    #[test]
    fn missing_salary_stays_null_not_zero() {
        let record: RawRecord = serde_json::from_value(json!({"id": "1"})).unwrap();
        let batch = transform(&[record], now());
        assert_eq!(batch.jobs[0].salary_min, None);
    }

    #[test]
    fn posting_week_derives_from_created() {
        let batch = transform(&[sample_record(json!("1"))], now());
        assert_eq!(batch.job_stats[0].posting_week, Some(41));
    }

    #[test]
    fn unparsable_created_nulls_the_week_without_dropping_the_row() {
        let record: RawRecord = serde_json::from_value(
            json!({"id": "1", "title": "Kept", "created": "last tuesday"}),
        )
        .unwrap();
        let batch = transform(&[record], now());
        assert_eq!(batch.jobs.len(), 1);
        assert_eq!(batch.jobs[0].title.as_deref(), Some("Kept"));
        assert_eq!(batch.jobs[0].created, None);
        assert_eq!(batch.job_stats[0].posting_week, None);
    }

    #[test]
    fn merge_rows_keeps_the_last_occurrence() {
        let old = CompanyRow {
            job_id: "1".into(),
            company_name: Some("Old Corp".into()),
        };
        let unrelated = CompanyRow {
            job_id: "2".into(),
            company_name: Some("Other".into()),
        };
        let new = CompanyRow {
            job_id: "1".into(),
            company_name: Some("New Corp".into()),
        };
        let merged = merge_rows(vec![old, unrelated], vec![new]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].company_name.as_deref(), Some("New Corp"));
        assert_eq!(merged[1].company_name.as_deref(), Some("Other"));
    }

    #[tokio::test]
    async fn merging_the_same_batch_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let batch = transform(&[sample_record(json!("1")), sample_record(json!("2"))], now());

        let first = merge_write(&store, date("2026-08-06"), batch.jobs.clone())
            .await
            .unwrap();
        let second = merge_write(&store, date("2026-08-06"), batch.jobs)
            .await
            .unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 2);

        let key = table_object_key(Stage::Processed, "jobs", date("2026-08-06"));
        let rows: Vec<JobRow> = decode_parquet(store.get(&key).await.unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn freshest_write_wins_for_a_shared_identity() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let mut stale = sample_record(json!("42"));
        stale.title = Some("Data Scientist".into());
        let mut fresh = sample_record(json!("42"));
        fresh.title = Some("Senior Data Scientist".into());

        merge_write(&store, date("2026-08-06"), transform(&[stale], now()).jobs)
            .await
            .unwrap();
        let count = merge_write(&store, date("2026-08-06"), transform(&[fresh], now()).jobs)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let key = table_object_key(Stage::Processed, "jobs", date("2026-08-06"));
        let rows: Vec<JobRow> = decode_parquet(store.get(&key).await.unwrap()).unwrap();
        assert_eq!(rows[0].title.as_deref(), Some("Senior Data Scientist"));
    }

    #[tokio::test]
    async fn parquet_partitions_roundtrip_typed_nulls() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let record: RawRecord = serde_json::from_value(json!({"title": "Sparse"})).unwrap();
        let batch = transform(&[record], now());

        merge_write(&store, date("2026-08-06"), batch.jobs.clone())
            .await
            .unwrap();
        let key = table_object_key(Stage::Processed, "jobs", date("2026-08-06"));
        let rows: Vec<JobRow> = decode_parquet(store.get(&key).await.unwrap()).unwrap();
        assert_eq!(rows, batch.jobs);
    }

    enum Scripted {
        Page(Vec<RawRecord>),
        Fail,
    }

    struct ScriptedSource {
        pages: Vec<Scripted>,
    }

    #[async_trait::async_trait]
    impl joblake_fetch::PageSource for ScriptedSource {
        async fn fetch_page(&self, page: u32, _per_page: u32) -> Result<FetchedPage, FetchError> {
            match self.pages.get((page - 1) as usize) {
                Some(Scripted::Page(records)) => Ok(FetchedPage {
                    page,
                    records: records.clone(),
                    body: serde_json::to_vec(&json!({"page": page})).unwrap(),
                    fetched_at: Utc::now(),
                }),
                Some(Scripted::Fail) => Err(FetchError::HttpStatus {
                    status: 500,
                    url: format!("scripted://page/{page}"),
                }),
                None => Ok(FetchedPage {
                    page,
                    records: Vec::new(),
                    body: Vec::new(),
                    fetched_at: Utc::now(),
                }),
            }
        }
    }

    fn pipeline_with(
        pages: Vec<Scripted>,
        dir: &std::path::Path,
    ) -> (IngestPipeline, LocalObjectStore) {
        let store = LocalObjectStore::new(dir);
        let pipeline = IngestPipeline::new(
            Box::new(ScriptedSource { pages }),
            Box::new(store.clone()),
        );
        (pipeline, store)
    }

    #[tokio::test]
    async fn pagination_stops_at_the_first_empty_page() {
        let dir = tempdir().expect("tempdir");
        let (pipeline, store) = pipeline_with(
            vec![
                Scripted::Page(vec![sample_record(json!("1")), sample_record(json!("2"))]),
                Scripted::Page(vec![sample_record(json!("3"))]),
            ],
            dir.path(),
        );

        let summary = pipeline.run_ingestion(10, 50).await.unwrap();
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.records_ingested, 3);
        assert_eq!(summary.persisted_rows.get("jobs"), Some(&3));

        let raw_pages = store.list("raw/pages").await.unwrap();
        assert_eq!(raw_pages.len(), 2);
    }

    #[tokio::test]
    async fn a_zero_page_run_completes_without_writing() {
        let dir = tempdir().expect("tempdir");
        let (pipeline, store) = pipeline_with(vec![], dir.path());

        let summary = pipeline.run_ingestion(10, 50).await.unwrap();
        assert_eq!(summary.pages_fetched, 0);
        assert_eq!(summary.records_ingested, 0);
        assert!(summary.partitions.is_empty());
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_failing_page_aborts_but_keeps_earlier_partitions() {
        let dir = tempdir().expect("tempdir");
        let (pipeline, store) = pipeline_with(
            vec![
                Scripted::Page(vec![sample_record(json!("1"))]),
                Scripted::Fail,
            ],
            dir.path(),
        );

        let err = pipeline.run_ingestion(10, 50).await.unwrap_err();
        assert!(err.to_string().contains("fetching page 2"));

        let jobs_keys = store.list("processed/jobs").await.unwrap();
        assert_eq!(jobs_keys.len(), 1);
        let rows: Vec<JobRow> =
            decode_parquet(store.get(&jobs_keys[0]).await.unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn identical_unidentified_postings_collapse_to_one_identity() {
        let dir = tempdir().expect("tempdir");
        let twin_a = record_without_id("Data Analyst", "DataCorp", "Boston");
        let twin_b = record_without_id("Data Analyst", "DataCorp", "Boston");
        let (pipeline, store) = pipeline_with(
            vec![Scripted::Page(vec![sample_record(json!("42")), twin_a, twin_b])],
            dir.path(),
        );

        let summary = pipeline.run_ingestion(10, 50).await.unwrap();
        assert_eq!(summary.records_ingested, 3);
        assert_eq!(summary.persisted_rows.get("jobs"), Some(&2));

        let jobs_keys = store.list("processed/jobs").await.unwrap();
        let rows: Vec<JobRow> =
            decode_parquet(store.get(&jobs_keys[0]).await.unwrap()).unwrap();
        let mut ids: Vec<_> = rows.iter().map(|r| r.job_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"42"));
    }
}
