use std::path::PathBuf;

/// Decompressed bytes requested from the codec per read
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Records accumulated before a batch is handed to the store
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Insert attempts per record before it is abandoned (the first attempt counts)
pub const MAX_INSERT_ATTEMPTS: u32 = 3;

/// Hex digits appended to an identifier after a collision
pub const ID_SUFFIX_LEN: usize = 8;

/// Progress update interval (tick every N lines)
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Bump when the on-disk checkpoint layout changes
pub const CHECKPOINT_VERSION: u32 = 1;

/// Save a checkpoint every N committed batches
pub const CHECKPOINT_INTERVAL: u32 = 1;

/// How long a connection waits on a locked database before giving up
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Zstd window log accepted when decoding. Reddit dumps are compressed with --long=31.
pub const ZSTD_WINDOW_LOG_MAX: u32 = 31;

/// Filename marker routed to the post pipeline
pub const POSTS_MARKER: &str = "submissions";

/// Filename marker routed to the comment pipeline
pub const COMMENTS_MARKER: &str = "comments";

/// Fullname prefix of a link (post) in a comment's `link_id`
pub const LINK_PREFIX: &str = "t3_";

/// Runtime knobs for a single ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub jobs: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_interval: u32,
    pub resume: bool,
    pub show_progress: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: MAX_INSERT_ATTEMPTS,
            jobs: 1,
            checkpoint_dir: None,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            resume: false,
            show_progress: false,
        }
    }
}

/// Accepts either a filesystem path or a `sqlite://` URL and returns the path part.
pub fn database_path(url: &str) -> PathBuf {
    let path = url
        .strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .unwrap_or(url);
    PathBuf::from(path)
}
