//! Console output retention: an in-memory ring for `tail` and the optional
//! per-node log file.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Bounded buffer of the most recent console output.
pub struct Ring {
    max_size: usize,
    current_size: usize,
    chunks: VecDeque<Bytes>,
}

impl Ring {
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            chunks: VecDeque::new(),
        }
    }

    /// Append a chunk, evicting the oldest output once over capacity.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() || self.max_size == 0 {
            return;
        }

        // A single oversized chunk keeps only its tail.
        let chunk = if chunk.len() > self.max_size {
            chunk.slice(chunk.len() - self.max_size..)
        } else {
            chunk
        };

        while self.current_size + chunk.len() > self.max_size {
            let Some(old) = self.chunks.pop_front() else {
                break;
            };
            self.current_size -= old.len();
        }

        self.current_size += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// The last `n` bytes of output, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.current_size);
        let mut skip = self.current_size - n;
        let mut out = Vec::with_capacity(n);
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.extend_from_slice(&chunk[skip..]);
            skip = 0;
        }
        out
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.current_size
    }
}

/// Append-only log of everything a console printed.
pub struct LogFile {
    path: PathBuf,
    file: File,
    failed: bool,
}

impl LogFile {
    /// Open (or create) `<dir>/<node>.log` for appending.
    pub async fn open(dir: &Path, node: &str) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{node}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            failed: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a chunk. Write failures are logged once and otherwise ignored so
    /// a full disk never takes a console down.
    pub async fn write(&mut self, chunk: &[u8]) {
        if let Err(e) = self.file.write_all(chunk).await {
            if !self.failed {
                warn!(path = %self.path.display(), error = %e, "Failed to write console log");
                self.failed = true;
            }
        } else {
            self.failed = false;
        }
    }

    pub async fn flush(&mut self) {
        if let Err(e) = self.file.flush().await {
            warn!(path = %self.path.display(), error = %e, "Failed to flush console log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_size() {
        let mut ring = Ring::new(1024);
        ring.append(Bytes::from_static(b"hello"));
        ring.append(Bytes::from_static(b"world"));
        assert_eq!(ring.size(), 10);
        assert_eq!(ring.tail(100), b"helloworld");
    }

    #[test]
    fn test_eviction() {
        let mut ring = Ring::new(10);
        ring.append(Bytes::from_static(b"hello"));
        ring.append(Bytes::from_static(b"world"));
        ring.append(Bytes::from_static(b"!"));
        assert_eq!(ring.size(), 6);
        assert_eq!(ring.tail(100), b"world!");
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut ring = Ring::new(4);
        ring.append(Bytes::from_static(b"ab"));
        ring.append(Bytes::from_static(b"0123456789"));
        assert_eq!(ring.size(), 4);
        assert_eq!(ring.tail(4), b"6789");
    }

    #[test]
    fn test_tail_spans_chunks() {
        let mut ring = Ring::new(1024);
        ring.append(Bytes::from_static(b"hello"));
        ring.append(Bytes::from_static(b"world"));
        assert_eq!(ring.tail(5), b"world");
        assert_eq!(ring.tail(7), b"loworld");
        assert!(ring.tail(0).is_empty());
    }

    #[tokio::test]
    async fn test_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::open(dir.path(), "n1").await.unwrap();
        log.write(b"first\n").await;
        log.flush().await;
        drop(log);

        let mut log = LogFile::open(dir.path(), "n1").await.unwrap();
        log.write(b"second\n").await;
        log.flush().await;

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
