//! Routes archives to the post or comment pipeline by file name.

use crate::checkpoint::{self, CheckpointManager};
use crate::config::{IngestConfig, COMMENTS_MARKER, POSTS_MARKER};
use crate::ingest::BatchIngestor;
use crate::models::{Comment, Post, Record};
use crate::pipeline::{FileReport, Pipeline};
use crate::reader::LineReader;
use crate::stats::IngestionStats;
use crate::store::Store;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ArchiveKind {
    Posts,
    Comments,
}

impl ArchiveKind {
    /// Record kind stored in checkpoints.
    pub fn record_kind(self) -> &'static str {
        match self {
            ArchiveKind::Posts => Post::KIND,
            ArchiveKind::Comments => Comment::KIND,
        }
    }
}

/// Picks the pipeline for a file name, or `None` when it matches neither marker.
pub fn classify(file_name: &str) -> Option<ArchiveKind> {
    let posts = file_name.contains(POSTS_MARKER);
    let comments = file_name.contains(COMMENTS_MARKER);
    match (posts, comments) {
        (true, true) => {
            warn!(
                file = file_name,
                "Name matches both posts and comments, routing to posts"
            );
            Some(ArchiveKind::Posts)
        }
        (true, false) => Some(ArchiveKind::Posts),
        (false, true) => Some(ArchiveKind::Comments),
        (false, false) => None,
    }
}

/// Runs one archive into `store`, honoring the checkpoint settings in `config`.
pub fn ingest_archive<S: Store>(
    path: &Path,
    kind: ArchiveKind,
    config: &IngestConfig,
    store: &mut S,
) -> Result<FileReport> {
    match kind {
        ArchiveKind::Posts => run_archive(Pipeline::<Post, _>::for_record(), path, kind, config, store),
        ArchiveKind::Comments => {
            run_archive(Pipeline::<Comment, _>::for_record(), path, kind, config, store)
        }
    }
}

fn run_archive<R, F, S>(
    pipeline: Pipeline<R, F>,
    path: &Path,
    kind: ArchiveKind,
    config: &IngestConfig,
    store: &mut S,
) -> Result<FileReport>
where
    R: Record,
    F: Fn(crate::models::RawRecord) -> Result<R, crate::error::RecordError>,
    S: Store,
{
    let mut reader = LineReader::open_with_chunk_size(path, config.chunk_size)
        .with_context(|| format!("Failed to open archive: {}", path.display()))?;

    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| kind.record_kind().to_string());

    let mut pipeline = pipeline
        .batch_size(config.batch_size)
        .ingestor(BatchIngestor::new(config.max_attempts))
        .label(label)
        .show_progress(config.show_progress);

    if let Some(dir) = &config.checkpoint_dir {
        if config.resume {
            if let Some(cp) = checkpoint::load_if_valid(path, dir, kind.record_kind())? {
                pipeline = pipeline.resume_from(cp);
            }
        }
        let manager =
            CheckpointManager::new(path, dir, kind.record_kind(), config.checkpoint_interval)?;
        pipeline = pipeline.checkpoint(manager);
    }

    let report = pipeline.run(&mut reader, store);
    reader.close();
    Ok(report)
}

/// Outcome of one archive in a directory run.
#[derive(Debug)]
pub struct FileSummary {
    pub path: PathBuf,
    pub kind: ArchiveKind,
    /// `Err` when the archive could not be opened or set up at all.
    pub result: Result<FileReport>,
}

impl FileSummary {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(report) if report.completed())
    }

    pub fn stats(&self) -> Option<&IngestionStats> {
        self.result.as_ref().ok().map(|r| &r.stats)
    }
}

#[derive(Debug, Default)]
pub struct DirectoryReport {
    pub files: Vec<FileSummary>,
    /// Files matching neither marker.
    pub skipped: Vec<PathBuf>,
}

impl DirectoryReport {
    pub fn totals(&self) -> IngestionStats {
        let mut total = IngestionStats::new();
        for stats in self.files.iter().filter_map(FileSummary::stats) {
            total.merge(stats);
        }
        total
    }

    pub fn failed(&self) -> usize {
        self.files.iter().filter(|f| !f.succeeded()).count()
    }
}

/// Ingests every classifiable archive in `dir`.
///
/// Each archive gets its own store from `open_store`. A failure in one archive
/// is recorded in its summary and does not stop the others. With `jobs > 1`
/// archives run on a rayon pool of that size; summaries keep name order.
pub fn ingest_directory<S, F>(dir: &Path, config: &IngestConfig, open_store: F) -> Result<DirectoryReport>
where
    S: Store,
    F: Fn() -> Result<S> + Sync,
{
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))? {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut report = DirectoryReport::default();
    let mut tasks = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match classify(&name) {
            Some(kind) => tasks.push((path, kind)),
            None => {
                info!(file = %name, "Skipping unrecognized file");
                report.skipped.push(path);
            }
        }
    }

    info!(
        archives = tasks.len(),
        skipped = report.skipped.len(),
        jobs = config.jobs,
        "Starting directory ingestion"
    );

    let run_one = |(path, kind): (PathBuf, ArchiveKind)| {
        info!(file = %path.display(), kind = kind.record_kind(), "Processing archive");
        let result = open_store().and_then(|mut store| ingest_archive(&path, kind, config, &mut store));
        if let Err(e) = &result {
            error!(file = %path.display(), "Error: {:#}", e);
        }
        FileSummary { path, kind, result }
    };

    report.files = if config.jobs > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.jobs)
            .build()
            .context("Failed to build thread pool")?;
        pool.install(|| tasks.into_par_iter().map(run_one).collect())
    } else {
        tasks.into_iter().map(run_one).collect()
    };

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zst(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        let bytes = zstd::stream::encode_all(text.as_bytes(), 3).unwrap();
        fs::File::create(&path).unwrap().write_all(&bytes).unwrap();
        path
    }

    fn post_line(id: &str) -> String {
        format!(
            r#"{{"id":"{id}","subreddit":"Bitcoin","title":"t","author":"a","created_utc":1,"num_comments":0,"score":1,"url":"u","permalink":"/p"}}"#
        )
    }

    #[test]
    fn classify_by_marker() {
        assert_eq!(classify("RS_2022-01_submissions.zst"), Some(ArchiveKind::Posts));
        assert_eq!(classify("RC_2022-01_comments.zst"), Some(ArchiveKind::Comments));
        assert_eq!(classify("readme.txt"), None);
        assert_eq!(classify("submissions_and_comments.zst"), Some(ArchiveKind::Posts));
    }

    #[test]
    fn kind_maps_to_record_kind() {
        assert_eq!(ArchiveKind::Posts.record_kind(), "post");
        assert_eq!(ArchiveKind::Comments.record_kind(), "comment");
    }

    #[test]
    fn directory_routes_and_skips() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir(&data).unwrap();
        write_zst(&data, "RS_submissions.zst", &format!("{}\n{}\n", post_line("p1"), post_line("p2")));
        write_zst(&data, "RC_comments.zst", "{\"id\":\"c1\",\"link_id\":\"t3_p1\"}\n");
        fs::write(data.join("notes.txt"), "ignore me").unwrap();

        let db = dir.path().join("reddit.db");
        SqliteStore::open(&db).unwrap().init_schema().unwrap();

        let report = ingest_directory(&data, &IngestConfig::default(), || SqliteStore::open(&db)).unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.skipped, vec![data.join("notes.txt")]);
        assert_eq!(report.failed(), 0);
        // sorted by name: RC_ before RS_
        assert_eq!(report.files[0].kind, ArchiveKind::Comments);
        assert_eq!(report.totals().records_committed, 3);

        let store = SqliteStore::open(&db).unwrap();
        assert_eq!(store.count("post").unwrap(), 2);
        assert_eq!(store.count("comment").unwrap(), 1);
    }

    #[test]
    fn store_open_failure_is_per_file() {
        let dir = TempDir::new().unwrap();
        write_zst(dir.path(), "RC_comments.zst", "{\"id\":\"c1\"}\n");

        let report = ingest_directory(dir.path(), &IngestConfig::default(), || {
            Err::<SqliteStore, _>(anyhow::anyhow!("no database"))
        })
        .unwrap();

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.files[0].stats().is_none());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = ingest_directory(&dir.path().join("nope"), &IngestConfig::default(), || {
            SqliteStore::open_in_memory()
        });
        assert!(result.is_err());
    }
}
