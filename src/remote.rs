//! Prometheus remote write/read wire format: snappy-compressed protobuf messages, and
//! conversion to and from the crate's own types.

use crate::error::{BridgeError, Result};
use crate::types;
use prost::Message;

/// Prometheus `prompb` messages used by remote write and remote read (samples response type).
pub mod prompb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteRequest {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: ::prost::alloc::vec::Vec<TimeSeries>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TimeSeries {
        #[prost(message, repeated, tag = "1")]
        pub labels: ::prost::alloc::vec::Vec<Label>,
        #[prost(message, repeated, tag = "2")]
        pub samples: ::prost::alloc::vec::Vec<Sample>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Label {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub value: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Sample {
        #[prost(double, tag = "1")]
        pub value: f64,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadRequest {
        #[prost(message, repeated, tag = "1")]
        pub queries: ::prost::alloc::vec::Vec<Query>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Query {
        #[prost(int64, tag = "1")]
        pub start_timestamp_ms: i64,
        #[prost(int64, tag = "2")]
        pub end_timestamp_ms: i64,
        #[prost(message, repeated, tag = "3")]
        pub matchers: ::prost::alloc::vec::Vec<LabelMatcher>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LabelMatcher {
        #[prost(enumeration = "label_matcher::Type", tag = "1")]
        pub r#type: i32,
        #[prost(string, tag = "2")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub value: ::prost::alloc::string::String,
    }

    pub mod label_matcher {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            Eq = 0,
            Neq = 1,
            Re = 2,
            Nre = 3,
        }
    }

    /// In the same order as the request's queries.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadResponse {
        #[prost(message, repeated, tag = "1")]
        pub results: ::prost::alloc::vec::Vec<QueryResult>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct QueryResult {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: ::prost::alloc::vec::Vec<TimeSeries>,
    }
}

fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| BridgeError::Decode(format!("snappy: {}", e)))
}

fn compress(buf: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(buf)
        .map_err(|e| BridgeError::Encode(format!("snappy: {}", e)))
}

/// Decodes a snappy-compressed remote write body.
pub fn decode_write_request(body: &[u8]) -> Result<Vec<types::TimeSeries>> {
    let raw = decompress(body)?;
    let req = prompb::WriteRequest::decode(raw.as_slice())
        .map_err(|e| BridgeError::Decode(format!("protobuf: {}", e)))?;
    Ok(req.timeseries.into_iter().map(series_from_proto).collect())
}

/// Decodes a snappy-compressed remote read body.
pub fn decode_read_request(body: &[u8]) -> Result<Vec<types::Query>> {
    let raw = decompress(body)?;
    let req = prompb::ReadRequest::decode(raw.as_slice())
        .map_err(|e| BridgeError::Decode(format!("protobuf: {}", e)))?;
    req.queries.into_iter().map(query_from_proto).collect()
}

/// Encodes series as a snappy-compressed `ReadResponse` holding one `QueryResult`.
pub fn encode_read_response(series: Vec<types::TimeSeries>) -> Result<Vec<u8>> {
    let resp = prompb::ReadResponse {
        results: vec![prompb::QueryResult {
            timeseries: series.into_iter().map(series_to_proto).collect(),
        }],
    };
    compress(&resp.encode_to_vec())
}

/// Encodes series as a snappy-compressed `WriteRequest`. Used by clients and tests.
pub fn encode_write_request(series: Vec<types::TimeSeries>) -> Result<Vec<u8>> {
    let req = prompb::WriteRequest {
        timeseries: series.into_iter().map(series_to_proto).collect(),
    };
    compress(&req.encode_to_vec())
}

/// Encodes queries as a snappy-compressed `ReadRequest`. Used by clients and tests.
pub fn encode_read_request(queries: &[types::Query]) -> Result<Vec<u8>> {
    let req = prompb::ReadRequest {
        queries: queries.iter().map(query_to_proto).collect(),
    };
    compress(&req.encode_to_vec())
}

/// Decodes a snappy-compressed `ReadResponse`, flattening all query results.
pub fn decode_read_response(body: &[u8]) -> Result<Vec<types::TimeSeries>> {
    let raw = decompress(body)?;
    let resp = prompb::ReadResponse::decode(raw.as_slice())
        .map_err(|e| BridgeError::Decode(format!("protobuf: {}", e)))?;
    Ok(resp
        .results
        .into_iter()
        .flat_map(|r| r.timeseries)
        .map(series_from_proto)
        .collect())
}

fn series_from_proto(ts: prompb::TimeSeries) -> types::TimeSeries {
    types::TimeSeries {
        labels: ts
            .labels
            .into_iter()
            .map(|l| types::Label::new(l.name, l.value))
            .collect(),
        samples: ts
            .samples
            .into_iter()
            .map(|s| types::Sample {
                timestamp_ms: s.timestamp,
                value: s.value,
            })
            .collect(),
    }
}

fn series_to_proto(ts: types::TimeSeries) -> prompb::TimeSeries {
    prompb::TimeSeries {
        labels: ts
            .labels
            .into_iter()
            .map(|l| prompb::Label {
                name: l.name,
                value: l.value,
            })
            .collect(),
        samples: ts
            .samples
            .into_iter()
            .map(|s| prompb::Sample {
                value: s.value,
                timestamp: s.timestamp_ms,
            })
            .collect(),
    }
}

fn query_from_proto(q: prompb::Query) -> Result<types::Query> {
    let matchers = q
        .matchers
        .into_iter()
        .map(|m| {
            let op = match prompb::label_matcher::Type::try_from(m.r#type) {
                Ok(prompb::label_matcher::Type::Eq) => types::MatchOp::Eq,
                Ok(prompb::label_matcher::Type::Neq) => types::MatchOp::Neq,
                Ok(prompb::label_matcher::Type::Re) => types::MatchOp::RegexMatch,
                Ok(prompb::label_matcher::Type::Nre) => types::MatchOp::RegexNoMatch,
                Err(_) => {
                    return Err(BridgeError::Decode(format!(
                        "unknown matcher type {}",
                        m.r#type
                    )))
                }
            };
            Ok(types::Matcher::new(m.name, op, m.value))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(types::Query {
        start_ms: q.start_timestamp_ms,
        end_ms: q.end_timestamp_ms,
        matchers,
    })
}

fn query_to_proto(q: &types::Query) -> prompb::Query {
    prompb::Query {
        start_timestamp_ms: q.start_ms,
        end_timestamp_ms: q.end_ms,
        matchers: q
            .matchers
            .iter()
            .map(|m| {
                let ty = match m.op {
                    types::MatchOp::Eq => prompb::label_matcher::Type::Eq,
                    types::MatchOp::Neq => prompb::label_matcher::Type::Neq,
                    types::MatchOp::RegexMatch => prompb::label_matcher::Type::Re,
                    types::MatchOp::RegexNoMatch => prompb::label_matcher::Type::Nre,
                };
                prompb::LabelMatcher {
                    r#type: ty as i32,
                    name: m.name.clone(),
                    value: m.value.clone(),
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Label, MatchOp, Matcher, Query, Sample, TimeSeries};

    #[test]
    fn test_write_request_decodes_labels_and_samples() {
        let series = vec![TimeSeries {
            labels: vec![Label::new("__name__", "up"), Label::new("job", "api")],
            samples: vec![Sample {
                timestamp_ms: 1_000,
                value: 1.0,
            }],
        }];
        let body = encode_write_request(series.clone()).unwrap();
        assert_eq!(decode_write_request(&body).unwrap(), series);
    }

    #[test]
    fn test_read_request_maps_matcher_types() {
        let queries = vec![Query {
            start_ms: 1_000,
            end_ms: 2_000,
            matchers: vec![
                Matcher::new("__name__", MatchOp::Eq, "up"),
                Matcher::new("job", MatchOp::RegexNoMatch, "api.*"),
            ],
        }];
        let body = encode_read_request(&queries).unwrap();
        assert_eq!(decode_read_request(&body).unwrap(), queries);
    }

    #[test]
    fn test_unknown_matcher_type_is_a_decode_error() {
        let req = prompb::ReadRequest {
            queries: vec![prompb::Query {
                start_timestamp_ms: 0,
                end_timestamp_ms: 1,
                matchers: vec![prompb::LabelMatcher {
                    r#type: 9,
                    name: "job".into(),
                    value: "api".into(),
                }],
            }],
        };
        let body = compress(&req.encode_to_vec()).unwrap();
        assert!(matches!(decode_read_request(&body), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn test_garbage_body_is_a_decode_error() {
        assert!(matches!(
            decode_write_request(&[0xff; 8]),
            Err(BridgeError::Decode(_))
        ));
    }

    #[test]
    fn test_read_response_has_one_result() {
        let body = encode_read_response(vec![TimeSeries::default(), TimeSeries::default()]).unwrap();
        let raw = decompress(&body).unwrap();
        let resp = prompb::ReadResponse::decode(raw.as_slice()).unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].timeseries.len(), 2);
    }
}
