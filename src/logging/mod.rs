//! Logging infrastructure
//!
//! Structured tracing goes to the subscriber configured in main; the audit
//! module adds a JSONL event stream for reconciliation tooling.

pub mod audit;

pub use audit::{AuditEvent, AuditKind, AuditLogger};
