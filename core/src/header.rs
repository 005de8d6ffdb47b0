use indexmap::IndexMap;
use safetensors::Dtype;
use safetensors::tensor::TensorInfo;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Largest header length we accept, same bound as the safetensors crate.
pub const MAX_HEADER_SIZE: usize = 100_000_000;

/// Size of the little-endian `u64` that prefixes every safetensors file.
pub const PREFIX_LEN: usize = 8;

const METADATA_KEY: &str = "__metadata__";

/// Structural problems found while decoding a safetensors header.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Fewer than 8 bytes were available.
    #[error("buffer holds {0} bytes, not enough for the 8-byte length prefix")]
    HeaderTooSmall(usize),

    /// The prefix declares more than [`MAX_HEADER_SIZE`] bytes.
    #[error("declared header length {0} exceeds the 100000000 byte limit")]
    HeaderTooLarge(u64),

    /// The buffer ends before the declared header does.
    #[error("declared header length {declared} needs {needed} bytes but only {available} are available")]
    Truncated {
        /// Header length read from the prefix.
        declared: usize,
        /// Prefix plus header.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The header body is not UTF-8.
    #[error("header body is not valid UTF-8")]
    InvalidUtf8,

    /// The header body is not a JSON object.
    #[error("header body is not a JSON object: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The same key appears twice in one header.
    #[error("entry {name:?} is declared more than once")]
    DuplicateTensor {
        /// The repeated key.
        name: String,
    },

    /// An entry does not match the tensor schema (unknown dtype, missing field).
    #[error("entry {name:?} is not a tensor description: {source}")]
    InvalidEntry {
        /// Tensor name.
        name: String,
        /// Schema error.
        #[source]
        source: serde_json::Error,
    },

    /// `data_offsets` ends before it starts.
    #[error("entry {name:?} has an inverted byte range [{start}, {end})")]
    InvertedRange {
        /// Tensor name.
        name: String,
        /// Declared start offset.
        start: usize,
        /// Declared end offset.
        end: usize,
    },

    /// The byte range disagrees with shape and dtype.
    #[error(
        "entry {name:?} declares {declared} bytes but {dtype:?} with shape {shape:?} needs {expected:?}"
    )]
    SizeMismatch {
        /// Tensor name.
        name: String,
        /// Declared dtype.
        dtype: Dtype,
        /// Declared shape.
        shape: Vec<usize>,
        /// `end - start`.
        declared: usize,
        /// `numel * width`, `None` on overflow.
        expected: Option<usize>,
    },
}

/// Metadata of a single tensor as declared by a shard header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorDescriptor {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    byte_size: u64,
}

impl TensorDescriptor {
    /// Builds a descriptor from a header entry, checking the declared byte
    /// range against `product(shape) * dtype width`.
    pub fn from_info(name: String, info: TensorInfo) -> Result<Self, DecodeError> {
        let (start, end) = info.data_offsets;
        let Some(declared) = end.checked_sub(start) else {
            return Err(DecodeError::InvertedRange { name, start, end });
        };
        let expected = info
            .shape
            .iter()
            .try_fold(info.dtype.size(), |acc, &dim| acc.checked_mul(dim));
        if expected != Some(declared) {
            return Err(DecodeError::SizeMismatch {
                name,
                dtype: info.dtype,
                shape: info.shape,
                declared,
                expected,
            });
        }
        Ok(Self {
            name,
            dtype: info.dtype,
            shape: info.shape,
            byte_size: declared as u64,
        })
    }

    /// Tensor name, unique within its shard.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Dimensions; empty for a scalar.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of the tensor payload in bytes.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Number of elements.
    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|&dim| dim as u64).product()
    }
}

/// A decoded shard header. Tensors keep the order in which the header
/// declares them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHeader {
    tensors: IndexMap<String, TensorDescriptor>,
    metadata: Option<BTreeMap<String, String>>,
    header_len: usize,
}

impl ShardHeader {
    /// Tensors by name, in declaration order.
    pub fn tensors(&self) -> &IndexMap<String, TensorDescriptor> {
        &self.tensors
    }

    /// Consumes the header, yielding tensors in declaration order.
    pub fn into_tensors(self) -> impl Iterator<Item = TensorDescriptor> {
        self.tensors.into_values()
    }

    /// Free-form `__metadata__` entries, if the header carries any.
    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.as_ref()
    }

    /// Length of the JSON body, as declared by the prefix.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Absolute file offset at which the data section begins.
    pub fn data_start(&self) -> usize {
        PREFIX_LEN + self.header_len
    }
}

/// Reads the declared header length from the 8-byte prefix.
pub fn declared_header_len(buffer: &[u8]) -> Result<usize, DecodeError> {
    let Some(prefix) = buffer.first_chunk::<PREFIX_LEN>() else {
        return Err(DecodeError::HeaderTooSmall(buffer.len()));
    };
    let n = u64::from_le_bytes(*prefix);
    match usize::try_from(n) {
        Ok(n) if n <= MAX_HEADER_SIZE => Ok(n),
        _ => Err(DecodeError::HeaderTooLarge(n)),
    }
}

/// Decodes the header at the start of `buffer`. Bytes past the header are
/// ignored.
pub fn decode_header(buffer: &[u8]) -> Result<ShardHeader, DecodeError> {
    let n = declared_header_len(buffer)?;
    let stop = PREFIX_LEN + n;
    if stop > buffer.len() {
        return Err(DecodeError::Truncated {
            declared: n,
            needed: stop,
            available: buffer.len(),
        });
    }
    let body =
        std::str::from_utf8(&buffer[PREFIX_LEN..stop]).map_err(|_| DecodeError::InvalidUtf8)?;

    // Writers pad the body with spaces; an all-padding body has no entries.
    let entries = if body.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str::<Entries>(body)
            .map_err(DecodeError::InvalidJson)?
            .0
    };

    let mut tensors = IndexMap::with_capacity(entries.len());
    let mut metadata = None;
    let mut seen_metadata = false;
    for (name, value) in entries {
        if name == METADATA_KEY {
            if seen_metadata {
                return Err(DecodeError::DuplicateTensor { name });
            }
            seen_metadata = true;
            metadata = free_form_metadata(value);
            continue;
        }
        if tensors.contains_key(&name) {
            return Err(DecodeError::DuplicateTensor { name });
        }
        let info: TensorInfo = match serde_json::from_value(value) {
            Ok(info) => info,
            Err(source) => return Err(DecodeError::InvalidEntry { name, source }),
        };
        let descriptor = TensorDescriptor::from_info(name.clone(), info)?;
        tensors.insert(name, descriptor);
    }

    Ok(ShardHeader {
        tensors,
        metadata,
        header_len: n,
    })
}

/// Top-level entries of a header in document order, repeated keys included.
struct Entries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Entries, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, serde_json::Value>()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

fn free_form_metadata(value: Value) -> Option<BTreeMap<String, String>> {
    match value {
        Value::Object(map) => Some(
            map.into_iter()
                .map(|(key, value)| match value {
                    Value::String(s) => (key, s),
                    other => (key, other.to_string()),
                })
                .collect(),
        ),
        Value::Null => None,
        other => {
            log::debug!("ignoring non-object {METADATA_KEY} entry: {other}");
            None
        }
    }
}
