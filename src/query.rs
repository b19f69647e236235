//! Read path: translates a time range plus label matchers into one downsampling SQL select,
//! and reassembles the flat result rows into per-series sample sequences.

use crate::error::{BridgeError, Result};
use crate::storage::SampleStore;
use crate::telemetry::{noop_event_listener, BridgeEvent, EventListener};
use crate::types::{series_key, Label, MatchOp, Matcher, Query, QueryRow, Sample, TimeSeries};
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for query translation.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub database: String,
    pub table: String,
    /// Upper bound on the number of points returned per series and query.
    pub max_samples: u32,
    /// Smallest bucket width in seconds.
    pub min_period_secs: i64,
    /// Quantile used to aggregate the raw values of one bucket, in `[0, 1]`.
    pub quantile: f64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            database: "metrics".to_string(),
            table: "samples".to_string(),
            max_samples: 8192,
            min_period_secs: 10,
            quantile: 0.75,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("database", &self.database)?;
        validate_identifier("table", &self.table)?;
        if !(0.0..=1.0).contains(&self.quantile) {
            return Err(BridgeError::InvalidConfig(format!(
                "quantile must be within [0, 1], got {}",
                self.quantile
            )));
        }
        if self.min_period_secs < 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "min_period_secs must not be negative, got {}",
                self.min_period_secs
            )));
        }
        Ok(())
    }

    /// `database.table`, for identifiers already checked by [`validate_identifier`].
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Database and table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_identifier(what: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidConfig(format!(
            "{} must be a plain identifier, got {:?}",
            what, ident
        )))
    }
}

/// Escapes a string as a single-quoted SQL literal.
///
/// This is the only place literal text is escaped; every other literal travels as a typed
/// query parameter.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// A translated select: SQL text with `{name:String}` placeholders plus their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub sql: String,
    pub params: Vec<(String, String)>,
}

impl SelectQuery {
    /// Looks up a parameter value by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the SQL with every placeholder replaced by its quoted literal.
    ///
    /// One pass over the template; text inside substituted literals is never rescanned.
    pub fn inline(&self) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut rest = self.sql.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let bound = tail.find('}').and_then(|close| {
                let name = tail[1..close].strip_suffix(":String")?;
                self.param(name).map(|value| (close, value))
            });
            match bound {
                Some((close, value)) => {
                    out.push_str(&quote_literal(value));
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn placeholder(name: &str) -> String {
    format!("{{{}:String}}", name)
}

/// Collects parameter values while predicates are built, handing out unique names.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<(String, String)>,
}

impl Params {
    /// Registers a string value and returns its placeholder.
    pub fn bind(&mut self, value: impl Into<String>) -> String {
        let name = format!("m{}", self.values.len());
        let ph = placeholder(&name);
        self.values.push((name, value.into()));
        ph
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.values
    }
}

/// Computes the downsampling bucket width in seconds.
///
/// `max((end - start) / max_samples, min_period)`, using integer division.
///
/// # Errors
/// `InvalidRange` when `end < start`, `InvalidConfig` when `max_samples < 1`.
pub fn bucket_width(start_secs: i64, end_secs: i64, max_samples: u32, min_period_secs: i64) -> Result<i64> {
    if end_secs < start_secs {
        return Err(BridgeError::InvalidRange {
            start: start_secs,
            end: end_secs,
        });
    }
    if max_samples < 1 {
        return Err(BridgeError::InvalidConfig(format!(
            "max_samples must be at least 1, got {}",
            max_samples
        )));
    }
    let period = end_secs - start_secs;
    Ok((period / i64::from(max_samples)).max(min_period_secs))
}

/// The time part of a query in storage resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_secs: i64,
    pub end_secs: i64,
    pub bucket_secs: i64,
}

impl TimeWindow {
    pub fn for_query(query: &Query, config: &ReaderConfig) -> Result<Self> {
        // Same flooring as `SampleRecord::timestamp_secs` on the write path.
        let start_secs = query.start_ms.div_euclid(1000);
        let end_secs = query.end_ms.div_euclid(1000);
        let bucket_secs = bucket_width(start_secs, end_secs, config.max_samples, config.min_period_secs)?;
        Ok(TimeWindow {
            start_secs,
            end_secs,
            bucket_secs,
        })
    }

    /// Bucketed select columns, ending with the bucket timestamp in milliseconds as `t`.
    pub fn select_sql(&self) -> String {
        // A zero-width bucket would divide by zero in the backend.
        let w = self.bucket_secs.max(1);
        format!(
            "SELECT count() AS cnt, (intDiv(toUInt32(ts), {w}) * {w}) * 1000 AS t",
            w = w
        )
    }

    /// Coarse date partition bound plus the inclusive timestamp bounds.
    pub fn where_sql(&self) -> String {
        format!(
            "WHERE date >= toDate({start}) AND ts >= toDateTime({start}) AND ts <= toDateTime({end})",
            start = self.start_secs,
            end = self.end_secs
        )
    }
}

/// Translates one matcher into a SQL predicate, binding its literals into `params`.
pub fn matcher_predicate(matcher: &Matcher, params: &mut Params) -> String {
    if matcher.targets_metric_name() {
        // The metric name has its own column; match it directly.
        let p = params.bind(matcher.value.as_str());
        return match matcher.op {
            MatchOp::Eq => format!("name = {}", p),
            MatchOp::Neq => format!("name != {}", p),
            MatchOp::RegexMatch => format!("match(name, {}) = 1", p),
            MatchOp::RegexNoMatch => format!("match(name, {}) = 0", p),
        };
    }

    match matcher.op {
        MatchOp::Eq | MatchOp::Neq => {
            // The value is an alternation: `a|b` matches either tag.
            let alternatives: Vec<String> = matcher
                .value
                .split('|')
                .filter(|alt| !alt.is_empty())
                .map(|alt| params.bind(format!("{}={}", matcher.name, alt)))
                .collect();
            let expected = if matcher.op == MatchOp::Eq { 1 } else { 0 };
            format!("hasAny(tags, [{}]) = {}", alternatives.join(", "), expected)
        }
        MatchOp::RegexMatch | MatchOp::RegexNoMatch => {
            // Tags are stored as `key=value`, so the anchor moves in front of the key.
            let value = matcher.value.strip_prefix('^').unwrap_or(&matcher.value);
            let p = params.bind(format!("^{}={}", matcher.name, value));
            let expected = if matcher.op == MatchOp::RegexMatch { 1 } else { 0 };
            format!("arrayExists(x -> match(x, {}) = 1, tags) = {}", p, expected)
        }
    }
}

/// Builds the full downsampling select for one query.
///
/// # Errors
/// Validation errors from [`bucket_width`]; nothing is sent to the backend in that case.
pub fn build_select(query: &Query, config: &ReaderConfig) -> Result<SelectQuery> {
    let window = TimeWindow::for_query(query, config)?;

    let mut params = Params::default();
    let predicates: Vec<String> = query
        .matchers
        .iter()
        .map(|m| matcher_predicate(m, &mut params))
        .collect();

    let mut sql = format!(
        "{}, name, tags, quantile({})(val) AS value FROM {} {}",
        window.select_sql(),
        config.quantile,
        config.qualified_table(),
        window.where_sql()
    );
    for predicate in &predicates {
        sql.push_str(" AND ");
        sql.push_str(predicate);
    }
    sql.push_str(" GROUP BY t, name, tags ORDER BY t");

    Ok(SelectQuery {
        sql,
        params: params.into_vec(),
    })
}

/// Splits stored tags back into labels. Empty values are dropped; tags without `=` are
/// returned separately as malformed.
pub fn labels_from_tags(tags: &[String]) -> (Vec<Label>, Vec<String>) {
    let mut labels = Vec::with_capacity(tags.len());
    let mut malformed = Vec::new();
    for tag in tags {
        match tag.split_once('=') {
            Some((_, "")) => {}
            Some((name, value)) => labels.push(Label::new(name, value)),
            None => malformed.push(tag.clone()),
        }
    }
    (labels, malformed)
}

/// Series under construction, keyed by their tag identity. Insertion order is preserved.
#[derive(Debug, Default)]
pub struct SeriesSet {
    index: HashMap<Vec<u8>, usize>,
    series: Vec<TimeSeries>,
}

impl SeriesSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the row's sample to its series, creating the series on first sight.
    /// Returns the tags that could not be split into labels.
    pub fn push_row(&mut self, row: QueryRow) -> Vec<String> {
        let key = series_key(&row.tags);
        let mut malformed = Vec::new();
        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None => {
                let (labels, bad) = labels_from_tags(&row.tags);
                malformed = bad;
                self.series.push(TimeSeries {
                    labels,
                    samples: Vec::new(),
                });
                self.index.insert(key, self.series.len() - 1);
                self.series.len() - 1
            }
        };
        self.series[idx].samples.push(Sample {
            timestamp_ms: row.timestamp_ms,
            value: row.value,
        });
        malformed
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Flattens the set into a list, in first-seen order.
    pub fn into_series(self) -> Vec<TimeSeries> {
        self.series
    }
}

/// Runs translated queries against a store and assembles the response series.
#[derive(Debug)]
pub struct Reader {
    store: Arc<dyn SampleStore>,
    config: ReaderConfig,
    events: Arc<dyn EventListener>,
}

impl Reader {
    pub fn new(
        store: Arc<dyn SampleStore>,
        config: ReaderConfig,
        events: Arc<dyn EventListener>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Reader {
            store,
            config,
            events,
        })
    }

    pub fn with_store(store: Arc<dyn SampleStore>) -> Result<Self> {
        Self::new(store, ReaderConfig::default(), noop_event_listener())
    }

    /// Executes every query and merges all rows into one series list.
    ///
    /// Series with identical tags coming from different queries are merged into one.
    ///
    /// # Errors
    /// A validation error or a backend error aborts the remaining queries. Rows that fail to
    /// decode are reported through the event listener and skipped.
    pub fn read(&self, queries: &[Query]) -> Result<Vec<TimeSeries>> {
        let mut set = SeriesSet::new();
        let mut rows = 0u64;

        for query in queries {
            let select = build_select(query, &self.config)?;
            self.events.on_event(BridgeEvent::QueryStarted {
                start_ms: query.start_ms,
                end_ms: query.end_ms,
                sql: select.sql.clone(),
            });

            let results = self.store.query(&select).map_err(|e| {
                self.events.on_event(BridgeEvent::QueryFailed {
                    sql: select.sql.clone(),
                    error: e.to_string(),
                });
                e
            })?;

            for result in results {
                match result {
                    Ok(row) => {
                        rows += 1;
                        for tag in set.push_row(row) {
                            self.events.on_event(BridgeEvent::MalformedTag { tag });
                        }
                    }
                    Err(e) => self.events.on_event(BridgeEvent::RowDecodeFailed {
                        error: e.to_string(),
                    }),
                }
            }
        }

        self.events.on_event(BridgeEvent::ReadCompleted {
            queries: queries.len(),
            rows,
            series: set.len(),
        });
        Ok(set.into_series())
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }
}
