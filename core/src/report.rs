use crate::header::{ShardHeader, TensorDescriptor};
use crate::locate::ShardRef;
use log::warn;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use url::Url;

/// Coarse error class of a failed shard, for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShardErrorKind {
    /// Retries were exhausted.
    TransientFetch,
    /// The request failed in a way retrying cannot fix.
    PermanentFetch,
    /// The header bytes did not decode.
    MalformedHeader,
}

impl fmt::Display for ShardErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransientFetch => "transient fetch error",
            Self::PermanentFetch => "permanent fetch error",
            Self::MalformedHeader => "malformed header",
        })
    }
}

/// A shard that could not be inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    /// Shard file name.
    pub filename: String,
    /// Shard URL.
    pub url: Url,
    /// Error class.
    pub kind: ShardErrorKind,
    /// Full error text.
    pub message: String,
}

/// Disagreement between shards, or between a shard and the index. Never
/// fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Inconsistency {
    /// The same tensor name appears in two shards. Both copies are kept.
    DuplicateTensor {
        /// Tensor name.
        name: String,
        /// Shard where the name was first seen.
        first_shard: String,
        /// Shard declaring it again.
        duplicate_shard: String,
    },
    /// The index places a tensor in a shard whose header lacks it.
    MissingFromShard {
        /// Tensor name.
        name: String,
        /// Shard named by the index.
        shard: String,
    },
    /// A shard header declares a tensor the index does not mention.
    UnindexedTensor {
        /// Tensor name.
        name: String,
        /// Shard declaring it.
        shard: String,
    },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTensor {
                name,
                first_shard,
                duplicate_shard,
            } => write!(
                f,
                "tensor {name:?} appears in both {first_shard} and {duplicate_shard}"
            ),
            Self::MissingFromShard { name, shard } => {
                write!(f, "index places {name:?} in {shard}, but its header lacks it")
            }
            Self::UnindexedTensor { name, shard } => {
                write!(f, "{shard} declares {name:?}, which the index does not list")
            }
        }
    }
}

/// Result of inspecting a model: every tensor of the shards that could be
/// read, in shard order then header order, with totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateReport {
    tensors: Vec<TensorDescriptor>,
    total_count: usize,
    total_bytes: u64,
    total_parameters: u64,
    failures: Vec<ShardFailure>,
    inconsistencies: Vec<Inconsistency>,
}

impl AggregateReport {
    /// Tensors of every inspected shard, in shard order then header order.
    pub fn tensors(&self) -> &[TensorDescriptor] {
        &self.tensors
    }

    /// Number of tensors.
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// Sum of tensor byte sizes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Sum of element counts.
    pub fn total_parameters(&self) -> u64 {
        self.total_parameters
    }

    /// Shards left out of the totals, in shard order.
    pub fn failures(&self) -> &[ShardFailure] {
        &self.failures
    }

    /// Disagreements found between shards and the index.
    pub fn inconsistencies(&self) -> &[Inconsistency] {
        &self.inconsistencies
    }

    /// Whether some shard was left out.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Bytes per dtype, keyed by the dtype's safetensors name.
    pub fn bytes_by_dtype(&self) -> BTreeMap<String, u64> {
        let mut bytes = BTreeMap::new();
        for tensor in &self.tensors {
            *bytes.entry(format!("{:?}", tensor.dtype())).or_default() += tensor.byte_size();
        }
        bytes
    }
}

/// Accumulates shard results in the order they are pushed. Only the
/// scheduler's collecting task owns one.
#[derive(Debug, Default)]
pub(crate) struct ReportBuilder {
    tensors: Vec<TensorDescriptor>,
    seen: HashMap<String, String>,
    failures: Vec<ShardFailure>,
    inconsistencies: Vec<Inconsistency>,
    succeeded: usize,
}

impl ReportBuilder {
    pub(crate) fn push_shard(&mut self, shard: &ShardRef, header: ShardHeader) {
        self.succeeded += 1;
        if let Some(indexed) = shard.indexed_tensors() {
            self.cross_check(shard, indexed, &header);
        }
        for tensor in header.into_tensors() {
            match self.seen.entry(tensor.name().to_string()) {
                Entry::Occupied(first) => {
                    self.inconsistencies.push(Inconsistency::DuplicateTensor {
                        name: tensor.name().to_string(),
                        first_shard: first.get().clone(),
                        duplicate_shard: shard.filename().to_string(),
                    });
                }
                Entry::Vacant(entry) => {
                    entry.insert(shard.filename().to_string());
                }
            }
            self.tensors.push(tensor);
        }
    }

    fn cross_check(&mut self, shard: &ShardRef, indexed: &[String], header: &ShardHeader) {
        let tensors = header.tensors();
        for name in indexed {
            if !tensors.contains_key(name) {
                self.inconsistencies.push(Inconsistency::MissingFromShard {
                    name: name.clone(),
                    shard: shard.filename().to_string(),
                });
            }
        }
        let indexed: HashSet<&str> = indexed.iter().map(String::as_str).collect();
        for name in tensors.keys() {
            if !indexed.contains(name.as_str()) {
                self.inconsistencies.push(Inconsistency::UnindexedTensor {
                    name: name.clone(),
                    shard: shard.filename().to_string(),
                });
            }
        }
    }

    pub(crate) fn push_failure(&mut self, failure: ShardFailure) {
        self.failures.push(failure);
    }

    pub(crate) fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub(crate) fn into_failures(self) -> Vec<ShardFailure> {
        self.failures
    }

    /// Freezes the report; totals are computed once, here.
    pub(crate) fn finish(self) -> AggregateReport {
        for inconsistency in &self.inconsistencies {
            warn!("data inconsistency: {inconsistency}");
        }
        let total_bytes: u64 = self.tensors.iter().map(TensorDescriptor::byte_size).sum();
        let total_parameters: u64 = self.tensors.iter().map(TensorDescriptor::numel).sum();
        AggregateReport {
            total_count: self.tensors.len(),
            total_bytes,
            total_parameters,
            tensors: self.tensors,
            failures: self.failures,
            inconsistencies: self.inconsistencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::decode_header;
    use crate::testing::safetensors_file;

    fn shard(filename: &str) -> ShardRef {
        let url = Url::parse("https://huggingface.co/org/model/resolve/main/")
            .unwrap()
            .join(filename)
            .unwrap();
        ShardRef::new(filename, url)
    }

    fn header(entries: &[(&str, &str, &[usize])]) -> ShardHeader {
        decode_header(&safetensors_file(entries)).unwrap()
    }

    #[test]
    fn test_totals() {
        let mut builder = ReportBuilder::default();
        builder.push_shard(
            &shard("a.safetensors"),
            header(&[("w", "F32", &[4, 4]), ("b", "F32", &[4])]),
        );
        builder.push_shard(&shard("b.safetensors"), header(&[("e", "BF16", &[10, 8])]));
        let report = builder.finish();

        assert_eq!(report.total_count(), 3);
        assert_eq!(report.total_bytes(), 64 + 16 + 160);
        assert_eq!(report.total_parameters(), 16 + 4 + 80);
        let names: Vec<&str> = report.tensors().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["w", "b", "e"]);
        assert_eq!(report.bytes_by_dtype()["F32"], 80);
        assert_eq!(report.bytes_by_dtype()["BF16"], 160);
        assert!(!report.is_partial());
        assert!(report.inconsistencies().is_empty());
    }

    #[test]
    fn test_empty_report() {
        let mut builder = ReportBuilder::default();
        builder.push_shard(&shard("model.safetensors"), header(&[]));
        assert_eq!(builder.succeeded(), 1);
        let report = builder.finish();
        assert_eq!(report.total_count(), 0);
        assert_eq!(report.total_bytes(), 0);
    }

    #[test]
    fn test_duplicate_is_kept_and_reported() {
        let mut builder = ReportBuilder::default();
        builder.push_shard(&shard("a.safetensors"), header(&[("w", "F32", &[2])]));
        builder.push_shard(&shard("b.safetensors"), header(&[("w", "F32", &[2])]));
        let report = builder.finish();

        assert_eq!(report.total_count(), 2);
        assert_eq!(report.total_bytes(), 16);
        assert_eq!(
            report.inconsistencies(),
            &[Inconsistency::DuplicateTensor {
                name: "w".to_string(),
                first_shard: "a.safetensors".to_string(),
                duplicate_shard: "b.safetensors".to_string(),
            }]
        );
    }

    #[test]
    fn test_index_cross_check() {
        let mut builder = ReportBuilder::default();
        let indexed = shard("a.safetensors")
            .with_indexed_tensors(vec!["w".to_string(), "gone".to_string()]);
        builder.push_shard(
            &indexed,
            header(&[("w", "F32", &[2]), ("extra", "F32", &[1])]),
        );
        let report = builder.finish();
        assert_eq!(
            report.inconsistencies(),
            &[
                Inconsistency::MissingFromShard {
                    name: "gone".to_string(),
                    shard: "a.safetensors".to_string(),
                },
                Inconsistency::UnindexedTensor {
                    name: "extra".to_string(),
                    shard: "a.safetensors".to_string(),
                },
            ]
        );
        assert_eq!(report.total_count(), 2);
    }

    #[test]
    fn test_failures_are_excluded_from_totals() {
        let mut builder = ReportBuilder::default();
        builder.push_shard(&shard("a.safetensors"), header(&[("w", "U8", &[7])]));
        let failed = shard("b.safetensors");
        builder.push_failure(ShardFailure {
            filename: failed.filename().to_string(),
            url: failed.url().clone(),
            kind: ShardErrorKind::TransientFetch,
            message: "HTTP 500".to_string(),
        });
        let report = builder.finish();
        assert!(report.is_partial());
        assert_eq!(report.total_count(), 1);
        assert_eq!(report.total_bytes(), 7);
        assert_eq!(report.failures()[0].filename, "b.safetensors");
    }

    #[test]
    fn test_report_serializes_dtype_names() {
        let mut builder = ReportBuilder::default();
        builder.push_shard(&shard("a.safetensors"), header(&[("w", "BF16", &[3])]));
        let json = serde_json::to_value(builder.finish()).unwrap();
        assert_eq!(json["tensors"][0]["dtype"], "BF16");
        assert_eq!(json["tensors"][0]["byte_size"], 6);
        assert_eq!(json["total_bytes"], 6);
    }
}
