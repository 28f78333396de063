//! Transactional batch insert with identifier-collision retry.
//!
//! Each record is added and flushed on its own so that uniqueness violations
//! surface while the batch transaction is still open. A colliding record gets a
//! fresh identifier derived from its original one and is tried again, up to a
//! fixed number of attempts. The transaction is committed once per batch.

use crate::config::{ID_SUFFIX_LEN, MAX_INSERT_ATTEMPTS};
use crate::error::IngestError;
use crate::models::Record;
use crate::store::{Rollback, Store};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// `<original>_<8 random hex digits>`
pub fn generate_new_id(original_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", original_id, &suffix[..ID_SUFFIX_LEN])
}

/// A record given up on. The batch carries on without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedRecord {
    /// Identifier as it appeared in the archive.
    pub id: String,
    pub attempts: u32,
    pub reason: String,
}

impl From<AbandonedRecord> for IngestError {
    fn from(record: AbandonedRecord) -> Self {
        IngestError::RecordAbandoned {
            id: record.id,
            reason: record.reason,
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub size: usize,
    /// Records that passed their flush check.
    pub inserted: u64,
    /// Inserted records that needed a new identifier.
    pub renamed: u64,
    pub collisions: u64,
    pub abandoned: Vec<AbandonedRecord>,
    pub commit_error: Option<IngestError>,
}

impl BatchReport {
    pub fn committed(&self) -> bool {
        self.commit_error.is_none()
    }
}

pub struct BatchIngestor {
    max_attempts: u32,
    new_id: fn(&str) -> String,
    batches: u64,
}

impl Default for BatchIngestor {
    fn default() -> Self {
        Self::new(MAX_INSERT_ATTEMPTS)
    }
}

impl BatchIngestor {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            new_id: generate_new_id,
            batches: 0,
        }
    }

    /// Replaces the identifier generator used after a collision.
    pub fn with_id_generator(mut self, new_id: fn(&str) -> String) -> Self {
        self.new_id = new_id;
        self
    }

    pub fn batches_submitted(&self) -> u64 {
        self.batches
    }

    /// Inserts every record of `batch` and commits once.
    pub fn ingest<R: Record, S: Store>(&mut self, store: &mut S, batch: Vec<R>) -> BatchReport {
        self.batches += 1;
        let batch_no = self.batches;
        let mut report = BatchReport {
            size: batch.len(),
            ..Default::default()
        };

        // A lock or I/O failure here is not a per-record problem: fail the batch.
        if let Err(source) = store.begin() {
            let err = IngestError::BatchCommitFailed {
                batch: batch_no,
                source,
            };
            error!(kind = R::KIND, records = report.size, "{err}");
            report.commit_error = Some(err);
            return report;
        }

        for record in batch {
            self.insert_one(store, record, &mut report);
        }

        match store.commit() {
            Ok(()) => {
                debug!(
                    batch = batch_no,
                    kind = R::KIND,
                    inserted = report.inserted,
                    abandoned = report.abandoned.len(),
                    "Batch committed"
                );
            }
            Err(source) => {
                if let Err(e) = store.rollback(Rollback::Transaction) {
                    error!(batch = batch_no, error = %e, "Rollback after failed commit also failed");
                }
                let err = IngestError::BatchCommitFailed {
                    batch: batch_no,
                    source,
                };
                error!(kind = R::KIND, rows = report.inserted, "{err}");
                report.commit_error = Some(err);
            }
        }

        report
    }

    fn insert_one<R: Record, S: Store>(&self, store: &mut S, mut record: R, report: &mut BatchReport) {
        let original_id = record.id().to_string();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match store.add(&record).and_then(|()| store.flush()) {
                Ok(()) => {
                    report.inserted += 1;
                    if attempts > 1 {
                        report.renamed += 1;
                        debug!(original = %original_id, id = record.id(), "Inserted under new id");
                    }
                    return;
                }
                Err(e) if e.is_unique_violation() => {
                    rollback_statement(store);
                    report.collisions += 1;
                    debug!(
                        "{}",
                        IngestError::IdentifierCollision {
                            id: record.id().to_string(),
                            attempt: attempts,
                        }
                    );
                    if attempts >= self.max_attempts {
                        warn!(
                            kind = R::KIND,
                            id = %original_id,
                            attempts,
                            "Failed after {attempts} attempts, abandoning record"
                        );
                        report.abandoned.push(AbandonedRecord {
                            id: original_id,
                            attempts,
                            reason: format!("identifier collided on all {attempts} attempts"),
                        });
                        return;
                    }
                    record.set_id((self.new_id)(&original_id));
                }
                Err(e) => {
                    rollback_statement(store);
                    warn!(kind = R::KIND, id = record.id(), error = %e, "Error inserting record");
                    report.abandoned.push(AbandonedRecord {
                        id: original_id,
                        attempts,
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

fn rollback_statement<S: Store>(store: &mut S) {
    if let Err(e) = store.rollback(Rollback::Statement) {
        warn!(error = %e, "Statement rollback failed");
    }
}
