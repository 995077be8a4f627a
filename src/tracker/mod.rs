//! Tracker abstraction layer
//!
//! A single configurable adapter drives authenticate / search /
//! duplicate-check / upload against any tracker from a declarative
//! schema. Specialization lives entirely in the schema; the code has no
//! per-tracker branches.

pub mod adapter;
pub mod options;
pub mod sanitize;
pub mod schema;
pub mod torznab;

pub use adapter::{
    AdapterHealth, DuplicateCheckResult, DuplicateQuery, FilePayload, FormPart, SearchHit,
    SearchMethod, TrackerAdapter, TrackerTestReport, UploadContext, UploadOutcome,
};
pub use schema::{load_schema, TrackerSchema};
