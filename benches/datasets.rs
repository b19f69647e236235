use promhouse::types::QueryRow;
use promhouse::{Label, MatchOp, Matcher, Query, Sample, TimeSeries};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_SEED: u64 = 0x_5052_4F4D_484F_5553; // fixed seed for stable benchmarks

/// Remote-write style batch: `series_count` series with `tag_pairs` random labels each.
pub fn generate_write_batch(
    seed: u64,
    series_count: usize,
    samples_per_series: usize,
    tag_pairs: usize,
    tag_cardinality: u32,
) -> Vec<TimeSeries> {
    assert!(tag_cardinality > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut batch = Vec::with_capacity(series_count);

    for s in 0..series_count {
        let mut labels = vec![Label::new("__name__", format!("metric_{}", s % 16))];
        // Reverse key order so the write path has sorting to do.
        for k in (0..tag_pairs).rev() {
            let v = rng.random_range(0..tag_cardinality);
            labels.push(Label::new(format!("k{}", k), format!("v{}", v)));
        }
        let samples = (0..samples_per_series)
            .map(|i| Sample {
                timestamp_ms: 1_700_000_000_000 + i as i64 * 15_000,
                value: rng.random::<u32>() as f64 * 0.001,
            })
            .collect();
        batch.push(TimeSeries { labels, samples });
    }

    batch
}

/// A remote-read query mixing every matcher kind.
pub fn mixed_query(tag_pairs: usize) -> Query {
    let mut matchers = vec![Matcher::new("__name__", MatchOp::RegexMatch, "metric_1.*")];
    for k in 0..tag_pairs {
        let op = match k % 4 {
            0 => MatchOp::Eq,
            1 => MatchOp::Neq,
            2 => MatchOp::RegexMatch,
            _ => MatchOp::RegexNoMatch,
        };
        matchers.push(Matcher::new(format!("k{}", k), op, "v1|v2|v3"));
    }
    Query {
        start_ms: 1_700_000_000_000,
        end_ms: 1_700_086_400_000,
        matchers,
    }
}

/// Result rows for `series_count` series over `buckets` time buckets, bucket-major like the
/// backend's `ORDER BY t`.
pub fn generate_rows(seed: u64, series_count: usize, buckets: usize) -> Vec<QueryRow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(series_count * buckets);
    for b in 0..buckets {
        for s in 0..series_count {
            rows.push(QueryRow {
                count: 1,
                timestamp_ms: 1_700_000_000_000 + b as i64 * 10_000,
                name: "metric".to_string(),
                tags: vec![
                    "__name__=metric".to_string(),
                    format!("instance=host{}", s),
                    "job=bench".to_string(),
                ],
                value: rng.random::<u32>() as f64,
            });
        }
    }
    rows
}
