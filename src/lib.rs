//! `dandi-dl`: a resumable, checksum-verifying downloader for versioned
//! scientific dataset archives (spec.md §1).
//!
//! The engine (`engine::coordinator` plus its components) is the
//! deliverable; the CLI binary is a thin shell around it.

pub mod engine;
pub mod error;
pub mod utils;
