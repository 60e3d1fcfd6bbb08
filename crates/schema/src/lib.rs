//! Loom schema: JSON-path parsing and evaluation over documents, plus the owner path
//! schema used to validate selector field keys.

#![forbid(unsafe_code)]

mod jsonpath;
mod paths;

pub use jsonpath::{eval_single, lookup, Filter, FilterOp, JsonPath, PathError, Segment};
pub use paths::{normalize_owner_key, owner_paths, OwnerPaths, DELIVERABLE_PATHS, WORKLOAD_PATHS};
