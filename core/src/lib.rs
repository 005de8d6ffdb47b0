#![deny(missing_docs)]
#![doc = include_str!("../../README.md")]
mod aggregate;
mod config;
mod fetch;
mod header;
mod locate;
mod report;
mod retry;
#[cfg(test)]
mod testing;

pub use aggregate::{
    AggregationFailure, Error, Inspector, Result, ShardError, aggregate, inspect_shard,
};
pub use config::{DEFAULT_HEADER_BUDGET, InspectConfig};
pub use fetch::{FailureReason, FetchError, RangeFetcher, RawHeader};
pub use header::{
    DecodeError, MAX_HEADER_SIZE, ShardHeader, TensorDescriptor, decode_header,
    declared_header_len,
};
pub use locate::{
    DEFAULT_ENDPOINT, DEFAULT_REVISION, LocateError, ModelRef, SAFETENSORS_FILE,
    SAFETENSORS_INDEX_FILE, SafetensorsIndex, ShardLocator, ShardRef,
};
pub use report::{AggregateReport, Inconsistency, ShardErrorKind, ShardFailure};
pub use retry::{Outcome, RetryPolicy, RetryState};
pub use safetensors::Dtype;
