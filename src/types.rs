/// Reserved label name carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Byte used to join sorted tags into a series identity key. Never valid inside UTF-8 text.
pub const SERIES_KEY_SEPARATOR: u8 = 0xff;

/// Timestamp type (milliseconds since epoch), as carried by the remote protocol.
pub type TimestampMs = i64;

/// Value type.
pub type Value = f64;

/// A single name/value label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Storage form of the label: `name=value`.
    pub fn to_tag(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Labels identifying one series. Names are expected to be unique.
pub type LabelSet = Vec<Label>;

/// A single observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: TimestampMs,
    pub value: Value,
}

/// A label set plus its ordered samples. Used both as write input and read output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    /// Returns the value of the reserved metric name label, or "" when absent.
    pub fn metric_name(&self) -> &str {
        self.labels
            .iter()
            .find(|l| l.name == METRIC_NAME_LABEL)
            .map(|l| l.value.as_str())
            .unwrap_or("")
    }

    /// All labels serialized as `name=value`, in label order.
    pub fn tags(&self) -> Vec<String> {
        self.labels.iter().map(Label::to_tag).collect()
    }
}

/// Flattened, storage-ready form of one sample. This is what the write queue carries.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub name: String,
    /// `key=value` strings, including the `__name__` entry. Sorted at flush time.
    pub tags: Vec<String>,
    pub value: Value,
    pub timestamp_ms: TimestampMs,
}

impl SampleRecord {
    /// Sorts tags in place so that equal label sets produce identical tag arrays.
    pub fn sort_tags(&mut self) {
        self.tags.sort_unstable();
    }

    /// Whole seconds since epoch, the resolution of the `ts` column.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }
}

/// Label matcher operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    Eq,
    Neq,
    RegexMatch,
    RegexNoMatch,
}

/// A predicate over one label's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl Matcher {
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Matcher {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    pub fn targets_metric_name(&self) -> bool {
        self.name == METRIC_NAME_LABEL
    }
}

/// A read query: inclusive millisecond time range plus ANDed matchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub start_ms: TimestampMs,
    pub end_ms: TimestampMs,
    pub matchers: Vec<Matcher>,
}

/// One aggregated row as returned by the backend for a translated query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub count: u64,
    /// Bucket start, milliseconds.
    pub timestamp_ms: TimestampMs,
    pub name: String,
    pub tags: Vec<String>,
    pub value: Value,
}

/// Builds the series identity key from a (sorted) tag array.
pub fn series_key(tags: &[String]) -> Vec<u8> {
    let len = tags.iter().map(|t| t.len() + 1).sum();
    let mut key = Vec::with_capacity(len);
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            key.push(SERIES_KEY_SEPARATOR);
        }
        key.extend_from_slice(tag.as_bytes());
    }
    key
}
