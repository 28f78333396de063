use crate::ingest::BatchReport;
use serde::{Deserialize, Serialize};

/// Counters collected while ingesting one archive (or, merged, a whole run).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStats {
    pub lines_read: u64,
    /// Lines passed over because a checkpoint said they were already committed.
    pub lines_skipped: u64,
    pub malformed_lines: u64,
    pub records_parsed: u64,
    pub collisions: u64,
    pub records_renamed: u64,
    pub records_abandoned: u64,
    pub records_committed: u64,
    /// Rows that were flushed but lost to a failed batch commit.
    pub rows_rolled_back: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
}

impl IngestionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_lines(&mut self) {
        self.lines_read += 1;
    }

    pub fn inc_skipped(&mut self) {
        self.lines_skipped += 1;
    }

    pub fn inc_malformed(&mut self) {
        self.malformed_lines += 1;
    }

    pub fn inc_parsed(&mut self) {
        self.records_parsed += 1;
    }

    pub fn batches(&self) -> u64 {
        self.batches_committed + self.batches_failed
    }

    pub fn record_batch(&mut self, report: &BatchReport) {
        self.collisions += report.collisions;
        self.records_renamed += report.renamed;
        self.records_abandoned += report.abandoned.len() as u64;
        if report.committed() {
            self.records_committed += report.inserted;
            self.batches_committed += 1;
        } else {
            self.rows_rolled_back += report.inserted;
            self.batches_failed += 1;
        }
    }

    pub fn merge(&mut self, other: &IngestionStats) {
        self.lines_read += other.lines_read;
        self.lines_skipped += other.lines_skipped;
        self.malformed_lines += other.malformed_lines;
        self.records_parsed += other.records_parsed;
        self.collisions += other.collisions;
        self.records_renamed += other.records_renamed;
        self.records_abandoned += other.records_abandoned;
        self.records_committed += other.records_committed;
        self.rows_rolled_back += other.rows_rolled_back;
        self.batches_committed += other.batches_committed;
        self.batches_failed += other.batches_failed;
    }
}
