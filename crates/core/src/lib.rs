//! `bulkscan-core`: domain building blocks for bulk scan orchestration.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): job
//! records and their status machine, per-item outcomes, partial commit log
//! records, and rate-aware batch sizing.

pub mod batch;
pub mod commit_log;
pub mod error;
pub mod id;
pub mod item;
pub mod job;

pub use batch::{BatchPlan, optimal_batch_size};
pub use commit_log::{FailedItem, PartialCommitLog};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use item::{ItemOutcome, ScanMode};
pub use job::{AdmissionHold, ItemError, JobRecord, JobStatus};
