//! Line -> record -> batch driver for a single archive.

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::{DEFAULT_BATCH_SIZE, PROGRESS_INTERVAL};
use crate::error::{IngestError, MalformedReason, RecordError};
use crate::ingest::BatchIngestor;
use crate::models::{RawRecord, Record};
use crate::reader::{ArchiveSource, LineReader};
use crate::stats::IngestionStats;
use crate::store::Store;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parses one line into a raw object that carries an `id`.
pub fn parse_line(line: &str) -> Result<RawRecord, MalformedReason> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) if map.contains_key("id") => Ok(map),
        Ok(Value::Object(_)) => Err(MalformedReason::MissingId),
        Ok(_) => Err(MalformedReason::NotAnObject),
        Err(e) => Err(MalformedReason::InvalidJson(e.to_string())),
    }
}

/// Result of running one archive through a pipeline.
#[derive(Debug)]
pub struct FileReport {
    pub stats: IngestionStats,
    /// `RecordAbandoned` for every record given up on, in input order.
    pub abandoned: Vec<IngestError>,
    /// Set when the archive stopped early: a fatal read error, or a failed
    /// batch while checkpointing.
    pub aborted: Option<IngestError>,
}

impl FileReport {
    pub fn completed(&self) -> bool {
        self.aborted.is_none()
    }
}

struct RunState {
    stats: IngestionStats,
    abandoned: Vec<IngestError>,
    /// Line number and stats as of the last batch commit.
    last_commit: (u64, IngestionStats),
}

pub struct Pipeline<R, F> {
    factory: F,
    batch_size: usize,
    ingestor: BatchIngestor,
    label: String,
    show_progress: bool,
    checkpoint: Option<CheckpointManager>,
    resume: Option<Checkpoint>,
    _record: std::marker::PhantomData<fn() -> R>,
}

impl<R: Record> Pipeline<R, fn(RawRecord) -> Result<R, RecordError>> {
    /// Pipeline using the record type's own factory.
    pub fn for_record() -> Self {
        Self::new(R::from_raw)
    }
}

impl<R, F> Pipeline<R, F>
where
    R: Record,
    F: Fn(RawRecord) -> Result<R, RecordError>,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            batch_size: DEFAULT_BATCH_SIZE,
            ingestor: BatchIngestor::default(),
            label: R::KIND.to_string(),
            show_progress: false,
            checkpoint: None,
            resume: None,
            _record: std::marker::PhantomData,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn ingestor(mut self, ingestor: BatchIngestor) -> Self {
        self.ingestor = ingestor;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn checkpoint(mut self, manager: CheckpointManager) -> Self {
        self.checkpoint = Some(manager);
        self
    }

    /// Skips the lines a previous run already committed and continues its stats.
    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.resume = Some(checkpoint);
        self
    }

    /// Streams every line of `reader` into `store`.
    ///
    /// With a checkpoint attached, a failed batch stops the run and the
    /// checkpoint is left at the last committed line, so a resumed run picks up
    /// exactly the lines that are not in the store yet.
    pub fn run<S: ArchiveSource, T: Store>(
        &mut self,
        reader: &mut LineReader<S>,
        store: &mut T,
    ) -> FileReport {
        let (stats, skip) = match self.resume.take() {
            Some(cp) => (cp.stats, cp.lines_committed),
            None => (IngestionStats::new(), 0),
        };
        if skip > 0 {
            info!(label = %self.label, lines = skip, "Resuming after committed lines");
        }
        let mut run = RunState {
            last_commit: (skip, stats.clone()),
            stats,
            abandoned: Vec::new(),
        };

        let pb = self.progress_bar();
        let mut batch: Vec<R> = Vec::with_capacity(self.batch_size.min(DEFAULT_BATCH_SIZE));
        let mut line_no = 0u64;
        let mut aborted = None;

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(source) => {
                    aborted = Some(IngestError::Decompression {
                        line: line_no,
                        source,
                    });
                    break;
                }
            };
            line_no += 1;
            if line_no % PROGRESS_INTERVAL == 0 {
                pb.set_position(line_no);
            }
            if line_no <= skip {
                run.stats.inc_skipped();
                continue;
            }
            run.stats.inc_lines();

            let record = parse_line(&line).and_then(|raw| {
                (self.factory)(raw).map_err(|e| MalformedReason::Invalid(e.to_string()))
            });
            match record {
                Ok(record) => {
                    run.stats.inc_parsed();
                    batch.push(record);
                }
                Err(reason) => {
                    run.stats.inc_malformed();
                    debug!("{}", IngestError::MalformedLine { line: line_no, reason });
                    continue;
                }
            }

            if batch.len() >= self.batch_size {
                let full = std::mem::take(&mut batch);
                if let Err(err) = self.submit(store, full, &mut run, line_no) {
                    aborted = Some(err);
                    break;
                }
            }
        }

        // Records parsed before a read error are still submitted; nothing is
        // submitted after a batch failure has stopped the run.
        let batch_failed = matches!(aborted, Some(IngestError::BatchCommitFailed { .. }));
        if !batch.is_empty() && !batch_failed {
            if let Err(err) = self.submit(store, batch, &mut run, line_no) {
                aborted.get_or_insert(err);
            }
        }

        pb.finish_and_clear();

        if let Some(manager) = &self.checkpoint {
            let outcome = match &aborted {
                // the save interval may have skipped the latest commits
                Some(_) => manager.save(run.last_commit.0, &run.last_commit.1),
                None => manager.clear(),
            };
            if let Err(e) = outcome {
                warn!(error = %e, path = ?manager.path(), "Checkpoint update failed");
            }
        }

        match &aborted {
            Some(err) => warn!(
                label = %self.label,
                committed_through = run.last_commit.0,
                error = %err,
                "Archive stopped early"
            ),
            None => info!(
                label = %self.label,
                lines = run.stats.lines_read,
                records = run.stats.records_committed,
                malformed = run.stats.malformed_lines,
                abandoned = run.stats.records_abandoned,
                "Archive ingested"
            ),
        }

        FileReport {
            stats: run.stats,
            abandoned: run.abandoned,
            aborted,
        }
    }

    /// Hands one batch to the ingestor. A failed commit is returned as an error
    /// only when a checkpoint is attached.
    fn submit<T: Store>(
        &mut self,
        store: &mut T,
        batch: Vec<R>,
        run: &mut RunState,
        line_no: u64,
    ) -> Result<(), IngestError> {
        let mut report = self.ingestor.ingest(store, batch);
        run.stats.record_batch(&report);
        run.abandoned
            .extend(report.abandoned.drain(..).map(IngestError::from));

        let Some(manager) = self.checkpoint.as_mut() else {
            return Ok(());
        };
        if let Some(err) = report.commit_error.take() {
            return Err(err);
        }
        run.last_commit = (line_no, run.stats.clone());
        if let Err(e) = manager.maybe_save(line_no, &run.stats) {
            warn!(error = %e, "Failed to save checkpoint");
        }
        Ok(())
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} {pos} lines") {
            pb.set_style(style);
        }
        pb.set_message(format!("Reading {}", self.label));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Comment, Post};
    use crate::reader::Codec;
    use crate::store::SqliteStore;
    use std::io::Cursor;

    fn reader(text: &str, chunk_size: usize) -> LineReader<Cursor<Vec<u8>>> {
        let bytes = zstd::stream::encode_all(text.as_bytes(), 3).unwrap();
        LineReader::new(Cursor::new(bytes), Codec::Zstd, chunk_size).unwrap()
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    #[test]
    fn parse_line_accepts_objects_with_id() {
        let raw = parse_line(r#"{"id":"p1","subreddit":"A"}"#).unwrap();
        assert_eq!(raw["id"], "p1");
    }

    #[test]
    fn parse_line_rejects_malformed_input() {
        assert!(matches!(
            parse_line("Invalid JSON"),
            Err(MalformedReason::InvalidJson(_))
        ));
        assert_eq!(
            parse_line(r#"{"subreddit":"NoID"}"#),
            Err(MalformedReason::MissingId)
        );
        assert_eq!(parse_line("[1,2,3]"), Err(MalformedReason::NotAnObject));
        assert!(matches!(parse_line(""), Err(MalformedReason::InvalidJson(_))));
    }

    #[test]
    fn split_stream_yields_two_records_and_one_malformed() {
        // chunk size 7 splits the first object mid-line
        let mut reader = reader("{\"id\":\"a\"}\nnot json\n{\"id\":\"b\"}\n", 7);
        let mut store = store();
        let report = Pipeline::<Comment, _>::for_record().run(&mut reader, &mut store);

        assert!(report.completed());
        assert_eq!(report.stats.records_parsed, 2);
        assert_eq!(report.stats.malformed_lines, 1);
        assert_eq!(store.ids("comment").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn batches_are_flushed_at_batch_size_and_at_end() {
        let text: String = (0..5).map(|i| format!("{{\"id\":\"c{i}\"}}\n")).collect();
        let mut reader = reader(&text, 16);
        let mut store = store();
        let report = Pipeline::<Comment, _>::for_record()
            .batch_size(2)
            .run(&mut reader, &mut store);

        assert_eq!(report.stats.batches_committed, 3);
        assert_eq!(report.stats.records_committed, 5);
        assert_eq!(
            store.ids("comment").unwrap(),
            vec!["c0", "c1", "c2", "c3", "c4"]
        );
    }

    #[test]
    fn factory_rejections_count_as_malformed() {
        // Posts need a title; the second line lacks one.
        let text = concat!(
            r#"{"id":"p1","subreddit":"A","title":"T1","author":"u","created_utc":1,"num_comments":0,"score":1,"url":"x","permalink":"/p1"}"#,
            "\n",
            r#"{"id":"p2","subreddit":"B"}"#,
            "\n",
        );
        let mut reader = reader(text, 32);
        let mut store = store();
        let report = Pipeline::<Post, _>::for_record().run(&mut reader, &mut store);

        assert_eq!(report.stats.records_committed, 1);
        assert_eq!(report.stats.malformed_lines, 1);
        assert_eq!(store.ids("post").unwrap(), vec!["p1"]);
    }

    #[test]
    fn custom_factory_is_applied() {
        let mut reader = reader("{\"id\":\"c1\",\"body\":\"hi\"}\n", 64);
        let mut store = store();
        let factory = |mut raw: RawRecord| {
            raw.insert("author".into(), Value::String("[deleted]".into()));
            Comment::from_raw(raw)
        };
        let report = Pipeline::<Comment, _>::new(factory).run(&mut reader, &mut store);
        assert_eq!(report.stats.records_committed, 1);
    }

    #[test]
    fn abandoned_records_are_reported() {
        let mut reader = reader("{\"id\":\"a\"}\n{\"id\":\"a\"}\n{\"id\":\"b\"}\n", 64);
        let mut store = store();
        let report = Pipeline::<Comment, _>::for_record()
            .ingestor(BatchIngestor::new(1))
            .run(&mut reader, &mut store);

        assert!(report.completed());
        assert_eq!(report.stats.records_abandoned, 1);
        assert_eq!(report.abandoned.len(), 1);
        assert!(matches!(
            &report.abandoned[0],
            IngestError::RecordAbandoned { id, .. } if id == "a"
        ));
        assert_eq!(store.ids("comment").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn closed_reader_aborts_the_archive() {
        let mut reader = reader("{\"id\":\"a\"}\n", 64);
        reader.close();
        let mut store = store();
        let report = Pipeline::<Comment, _>::for_record().run(&mut reader, &mut store);
        assert!(!report.completed());
        assert!(matches!(
            report.aborted,
            Some(IngestError::Decompression { line: 0, .. })
        ));
    }
}
