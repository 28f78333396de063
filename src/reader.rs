//! Streaming line reader over compressed archives.
//!
//! [`LineReader`] pulls fixed-size chunks of decompressed output from a codec and
//! reassembles them into lines. Only one partial line is ever buffered, so memory
//! stays bounded by the chunk size plus the longest line regardless of archive size.

use crate::config::{DEFAULT_CHUNK_SIZE, ZSTD_WINDOW_LOG_MAX};
use crate::error::ReaderError;
use bzip2::read::BzDecoder;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, BufReader, Cursor, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";

/// A seekable byte source that can report its compressed size without reading it.
pub trait ArchiveSource: Read + Seek {
    fn compressed_len(&self) -> io::Result<u64>;
}

impl ArchiveSource for File {
    fn compressed_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<T: AsRef<[u8]>> ArchiveSource for Cursor<T> {
    fn compressed_len(&self) -> io::Result<u64> {
        Ok(self.get_ref().as_ref().len() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zstd,
    Bzip2,
    Plain,
}

impl Codec {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zst" | "zstd" => Some(Codec::Zstd),
            "bz2" => Some(Codec::Bzip2),
            "json" | "jsonl" | "ndjson" | "txt" => Some(Codec::Plain),
            _ => None,
        }
    }

    pub fn from_magic(head: &[u8]) -> Self {
        if head.starts_with(&ZSTD_MAGIC) {
            Codec::Zstd
        } else if head.starts_with(&BZIP2_MAGIC) {
            Codec::Bzip2
        } else {
            Codec::Plain
        }
    }

    /// Extension first, then the leading bytes of the source. The source is rewound.
    pub fn detect<S: Read + Seek>(path: &Path, source: &mut S) -> io::Result<Self> {
        if let Some(codec) = Self::from_extension(path) {
            return Ok(codec);
        }
        let mut head = [0u8; 4];
        let mut filled = 0;
        while filled < head.len() {
            match source.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        source.seek(SeekFrom::Start(0))?;
        Ok(Self::from_magic(&head[..filled]))
    }
}

/// Decompression context owning the underlying source.
enum Decoder<S: Read> {
    Zstd(zstd::stream::read::Decoder<'static, BufReader<S>>),
    Bzip2(BzDecoder<S>),
    Plain(S),
}

impl<S: Read> Decoder<S> {
    fn new(codec: Codec, source: S) -> io::Result<Self> {
        Ok(match codec {
            Codec::Zstd => {
                let mut decoder = zstd::stream::read::Decoder::new(source)?;
                decoder.window_log_max(ZSTD_WINDOW_LOG_MAX)?;
                Decoder::Zstd(decoder)
            }
            Codec::Bzip2 => Decoder::Bzip2(BzDecoder::new(source)),
            Codec::Plain => Decoder::Plain(source),
        })
    }

    fn into_source(self) -> S {
        match self {
            Decoder::Zstd(d) => d.finish().into_inner(),
            Decoder::Bzip2(d) => d.into_inner(),
            Decoder::Plain(s) => s,
        }
    }
}

impl<S: Read> Read for Decoder<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Zstd(d) => d.read(buf),
            Decoder::Bzip2(d) => d.read(buf),
            Decoder::Plain(s) => s.read(buf),
        }
    }
}

/// Compressed size and record count of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveOverview {
    pub file_size_bytes: u64,
    pub line_count: u64,
}

pub struct LineReader<S: ArchiveSource = File> {
    codec: Codec,
    chunk_size: usize,
    decoder: Option<Decoder<S>>,
    buf: Vec<u8>,
    // Start of the unconsumed region of `buf`.
    start: usize,
    chunk: Vec<u8>,
    exhausted: bool,
}

impl LineReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReaderError> {
        Self::open_with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn open_with_chunk_size<P: AsRef<Path>>(
        path: P,
        chunk_size: usize,
    ) -> Result<Self, ReaderError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let codec = Codec::detect(path, &mut file)?;
        debug!(path = %path.display(), ?codec, "Opened archive");
        Self::new(file, codec, chunk_size)
    }
}

impl<S: ArchiveSource> LineReader<S> {
    pub fn new(source: S, codec: Codec, chunk_size: usize) -> Result<Self, ReaderError> {
        let chunk_size = chunk_size.max(1);
        Ok(Self {
            codec,
            chunk_size,
            decoder: Some(Decoder::new(codec, source)?),
            buf: Vec::new(),
            start: 0,
            chunk: vec![0u8; chunk_size],
            exhausted: false,
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_closed(&self) -> bool {
        self.decoder.is_none()
    }

    /// Lazy sequence of lines. Once the stream is exhausted, further calls yield
    /// nothing until [`reset`](Self::reset).
    pub fn lines(&mut self) -> Lines<'_, S> {
        Lines {
            reader: self,
            failed: false,
        }
    }

    /// Next complete line, the trailing partial line at end of stream, or `None`.
    pub fn next_line(&mut self) -> Option<Result<String, ReaderError>> {
        if self.decoder.is_none() {
            return Some(Err(ReaderError::Closed));
        }
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.buf[self.start..]) {
                let end = self.start + pos;
                let line = String::from_utf8_lossy(&self.buf[self.start..end]).into_owned();
                self.start = end + 1;
                return Some(Ok(line));
            }

            if self.exhausted {
                return None;
            }

            match self.fill() {
                Ok(0) => {
                    self.exhausted = true;
                    if self.start < self.buf.len() {
                        let line = String::from_utf8_lossy(&self.buf[self.start..]).into_owned();
                        self.clear_buffer();
                        return Some(Ok(line));
                    }
                    self.clear_buffer();
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Reads one chunk into the buffer, compacting consumed bytes first.
    fn fill(&mut self) -> Result<usize, ReaderError> {
        let decoder = self.decoder.as_mut().ok_or(ReaderError::Closed)?;
        let n = loop {
            match decoder.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(&self.chunk[..n]);
        Ok(n)
    }

    fn clear_buffer(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    /// Seeks the source back to offset zero and rebuilds the decompression context.
    pub fn reset(&mut self) -> Result<(), ReaderError> {
        let decoder = self.decoder.take().ok_or(ReaderError::Closed)?;
        let mut source = decoder.into_source();
        source.seek(SeekFrom::Start(0))?;
        self.decoder = Some(Decoder::new(self.codec, source)?);
        self.clear_buffer();
        self.exhausted = false;
        Ok(())
    }

    /// Compressed size plus a full scan counting non-blank lines. Leaves the reader
    /// rewound to the start.
    pub fn overview(&mut self) -> Result<ArchiveOverview, ReaderError> {
        let file_size_bytes = match &self.decoder {
            Some(decoder) => source_len(decoder)?,
            None => return Err(ReaderError::Closed),
        };

        self.reset()?;
        let mut line_count = 0u64;
        for line in self.lines() {
            if !line?.trim().is_empty() {
                line_count += 1;
            }
        }
        self.reset()?;

        Ok(ArchiveOverview {
            file_size_bytes,
            line_count,
        })
    }

    /// Up to `n` leading lines. Leaves the reader rewound to the start.
    pub fn head(&mut self, n: usize) -> Result<Vec<String>, ReaderError> {
        self.reset()?;
        let lines = self.lines().take(n).collect::<Result<Vec<_>, _>>();
        self.reset()?;
        lines
    }

    /// First line parsed as a JSON object, if it is one.
    pub fn header(&mut self) -> Result<Option<Map<String, Value>>, ReaderError> {
        let first = self.head(1)?;
        let header = first
            .first()
            .and_then(|line| match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "First line is not valid JSON");
                    None
                }
            });
        Ok(header)
    }

    /// Releases the source. Later reads fail with [`ReaderError::Closed`].
    pub fn close(&mut self) {
        if self.decoder.take().is_some() {
            self.clear_buffer();
            debug!("Archive closed");
        }
    }
}

fn source_len<S: ArchiveSource>(decoder: &Decoder<S>) -> io::Result<u64> {
    match decoder {
        Decoder::Zstd(d) => d.get_ref().get_ref().compressed_len(),
        Decoder::Bzip2(d) => d.get_ref().compressed_len(),
        Decoder::Plain(s) => s.compressed_len(),
    }
}

pub struct Lines<'a, S: ArchiveSource> {
    reader: &'a mut LineReader<S>,
    failed: bool,
}

impl<S: ArchiveSource> Iterator for Lines<'_, S> {
    type Item = Result<String, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.reader.next_line();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}
