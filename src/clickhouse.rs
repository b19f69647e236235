//! ClickHouse backend over the HTTP interface.
//!
//! Inserts are buffered per transaction and sent as one `INSERT ... FORMAT JSONEachRow` body
//! at commit. Selects are sent with their `{name:String}` parameters as `param_*` URL
//! parameters, so literal text never ends up inside the SQL.

use crate::error::{BridgeError, Result};
use crate::query::{validate_identifier, SelectQuery};
use crate::storage::{RowResult, SampleStore, StoreTransaction};
use crate::types::{QueryRow, SampleRecord};
use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;

/// Connection settings for [`ClickHouseStore`].
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://127.0.0.1:8123`.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub table: String,
    pub timeout: Duration,
    /// Create the samples table on connect if it does not exist.
    pub create_table: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        ClickHouseConfig {
            url: "http://127.0.0.1:8123".to_string(),
            user: None,
            password: None,
            database: "metrics".to_string(),
            table: "samples".to_string(),
            timeout: Duration::from_secs(30),
            create_table: false,
        }
    }
}

#[derive(Debug)]
pub struct ClickHouseStore {
    client: reqwest::blocking::Client,
    config: ClickHouseConfig,
    insert_sql: String,
}

impl ClickHouseStore {
    /// Builds the HTTP client and, with `create_table` set, creates the samples table.
    ///
    /// Must not be called from inside an async runtime: the blocking client owns one.
    pub fn connect(config: ClickHouseConfig) -> Result<Self> {
        validate_identifier("database", &config.database)?;
        validate_identifier("table", &config.table)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let insert_sql = format!(
            "INSERT INTO {}.{} (date, name, tags, val, ts) FORMAT JSONEachRow",
            config.database, config.table
        );
        let store = ClickHouseStore {
            client,
            config,
            insert_sql,
        };
        if store.config.create_table {
            store.ensure_schema()?;
        }
        Ok(store)
    }

    /// Creates the database and the samples table when missing.
    pub fn ensure_schema(&self) -> Result<()> {
        self.execute(
            "schema",
            &format!("CREATE DATABASE IF NOT EXISTS {}", self.config.database),
            None,
        )?;
        self.execute("schema", &create_table_sql(&self.config.database, &self.config.table), None)?;
        Ok(())
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    fn request(&self, sql: &str) -> reqwest::blocking::RequestBuilder {
        let mut req = self
            .client
            .post(self.config.url.as_str())
            .query(&[("query", sql)]);
        if let Some(user) = &self.config.user {
            req = req.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            req = req.header("X-ClickHouse-Key", password);
        }
        req
    }

    fn execute(&self, step: &'static str, sql: &str, body: Option<String>) -> Result<String> {
        let mut req = self.request(sql);
        if let Some(body) = body {
            req = req.body(body);
        }
        let resp = req
            .send()
            .map_err(|e| BridgeError::backend(step, e.to_string()))?;
        read_response(step, resp)
    }
}

fn read_response(step: &'static str, resp: reqwest::blocking::Response) -> Result<String> {
    let status = resp.status();
    let text = resp
        .text()
        .map_err(|e| BridgeError::backend(step, e.to_string()))?;
    if status.is_success() {
        Ok(text)
    } else {
        Err(BridgeError::backend(
            step,
            format!("HTTP {}: {}", status, text.trim()),
        ))
    }
}

/// DDL for the samples table.
pub fn create_table_sql(database: &str, table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (\
         date Date DEFAULT toDate(0), \
         name String, \
         tags Array(String), \
         val Float64, \
         ts DateTime\
         ) ENGINE = MergeTree PARTITION BY toYYYYMM(date) ORDER BY (date, name, tags, ts)",
        database, table
    )
}

impl SampleStore for ClickHouseStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(ClickHouseTransaction {
            store: self,
            body: String::new(),
            rows: 0,
        }))
    }

    fn query(&self, query: &SelectQuery) -> Result<Vec<RowResult>> {
        let sql = format!("{} FORMAT JSONEachRow", query.sql);
        let params: Vec<(String, &str)> = query
            .params
            .iter()
            .map(|(name, value)| (format!("param_{}", name), value.as_str()))
            .collect();
        let resp = self
            .request(&sql)
            .query(&params)
            .query(&[("output_format_json_quote_64bit_integers", "0")])
            .send()
            .map_err(|e| BridgeError::backend("query", e.to_string()))?;
        let text = read_response("query", resp)?;

        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(decode_row)
            .collect())
    }

    fn ping(&self) -> Result<()> {
        let url = format!("{}/ping", self.config.url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| BridgeError::backend("ping", e.to_string()))?;
        read_response("ping", resp).map(|_| ())
    }
}

struct ClickHouseTransaction<'a> {
    store: &'a ClickHouseStore,
    body: String,
    rows: usize,
}

impl StoreTransaction for ClickHouseTransaction<'_> {
    fn insert(&mut self, record: &SampleRecord) -> Result<()> {
        let line = encode_row(record)?;
        self.body.push_str(&line);
        self.body.push('\n');
        self.rows += 1;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        if self.rows == 0 {
            return Ok(());
        }
        let ClickHouseTransaction { store, body, .. } = *self;
        store.execute("commit", &store.insert_sql, Some(body))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct InsertRow<'a> {
    date: String,
    name: &'a str,
    tags: &'a [String],
    #[serde(serialize_with = "serialize_float")]
    val: f64,
    ts: i64,
}

// JSON has no NaN or infinity; ClickHouse parses these spellings from strings.
fn serialize_float<S: Serializer>(v: &f64, s: S) -> std::result::Result<S::Ok, S::Error> {
    if v.is_nan() {
        s.serialize_str("nan")
    } else if v.is_infinite() {
        s.serialize_str(if *v > 0.0 { "inf" } else { "-inf" })
    } else {
        s.serialize_f64(*v)
    }
}

/// Serializes one record as a JSONEachRow line (without the trailing newline).
pub fn encode_row(record: &SampleRecord) -> Result<String> {
    let secs = record.timestamp_secs();
    let date = chrono::DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| BridgeError::backend("exec", format!("timestamp out of range: {}", secs)))?
        .date_naive()
        .format("%Y-%m-%d")
        .to_string();
    let row = InsertRow {
        date,
        name: &record.name,
        tags: &record.tags,
        val: record.value,
        ts: secs,
    };
    Ok(serde_json::to_string(&row)?)
}

#[derive(Deserialize)]
struct SelectRow {
    cnt: u64,
    t: i64,
    name: String,
    tags: Vec<String>,
    // Non-finite aggregates come back as null.
    value: Option<f64>,
}

/// Decodes one JSONEachRow line of the downsampling select.
pub fn decode_row(line: &str) -> RowResult {
    let row: SelectRow =
        serde_json::from_str(line).map_err(|e| BridgeError::RowDecode(e.to_string()))?;
    Ok(QueryRow {
        count: row.cnt,
        timestamp_ms: row.t,
        name: row.name,
        tags: row.tags,
        value: row.value.unwrap_or(f64::NAN),
    })
}
