//! Resumable, deduplicating, chunked uploads to a remote object store.

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod file;
pub mod ledger;
pub mod plan;
pub mod progress;
pub mod remote;
pub mod util;
