//! Redload: streaming ingestion of Reddit archive dumps into a relational store
//!
//! Reddit dumps are newline-delimited JSON, one object per post or comment,
//! compressed with zstd (long window) or bzip2. This crate reads them in a
//! single streaming pass and loads them into SQLite:
//!
//! 1. **Decompression** -- Fixed-size chunks are pulled through the codec and
//!    split into lines; output never depends on where chunk boundaries fall
//! 2. **Parsing** -- Each line is decoded as JSON and turned into a typed
//!    record by a factory; malformed lines are counted and skipped
//! 3. **Batching** -- Records are grouped and inserted in one transaction per
//!    batch; every record is flushed on its own so that identifier collisions
//!    surface early and can be retried under a suffixed identifier
//! 4. **Dispatch** -- A directory is scanned and each archive routed to the
//!    post or comment pipeline by file name
//!
//! # Failure model
//!
//! - A malformed line never stops a file
//! - A record that keeps colliding is abandoned after a bounded number of
//!   attempts; the batch goes on without it
//! - A failed commit rolls back only its own batch
//! - A read error stops only its own archive; sibling archives continue
//!
//! # Key Modules
//!
//! - [`reader`] -- Chunked line reader over zstd, bzip2 or plain archives
//! - [`pipeline`] -- Line -> record -> batch driver for one archive
//! - [`ingest`] -- Transactional batch insert with collision retry
//! - [`dispatch`] -- Directory scan and file-name routing
//! - [`store`] -- Store trait and its SQLite implementation
//! - [`models`] -- Post and comment records
//! - [`checkpoint`] -- Per-archive resume points
//! - [`stats`] -- Ingestion counters
//! - [`error`] -- Error types
//! - [`config`] -- Constants and runtime settings
//!
//! # Example Usage
//!
//! ```bash
//! # Create the schema
//! redload init --database reddit.db
//!
//! # Load every archive in a directory, four at a time
//! redload ingest --dir dumps/ --database reddit.db --jobs 4
//!
//! # Load a single archive with resumable checkpoints
//! redload ingest-file -i RC_2023-01.zst --kind comments --checkpoint-dir state/ --resume
//! ```

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod reader;
pub mod stats;
pub mod store;
