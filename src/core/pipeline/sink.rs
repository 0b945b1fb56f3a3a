//! Delivery sink: where a completed inbound transfer's bytes go.
//!
//! The engine opens a writer, waits for `ready_to_stream`, streams the
//! persisted segments in order and closes the writer. Only after a
//! successful close are the segments removed from the store.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::error::{Result, TransferError};
use crate::core::transfer::FileMetadata;

#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn open(&self, file: &FileMetadata) -> Result<Box<dyn SinkWriter>>;
}

#[async_trait]
pub trait SinkWriter: Send {
    /// Resolves once the sink is ready to accept bytes.
    async fn ready_to_stream(&mut self) -> Result<()>;

    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Commit the delivered bytes.
    async fn close(&mut self) -> Result<()>;
}

// ── Directory sink ───────────────────────────────────────────────────────────

/// Writes each file into `dir` through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DeliverySink for FileSink {
    async fn open(&self, file: &FileMetadata) -> Result<Box<dyn SinkWriter>> {
        fs::create_dir_all(&self.dir).await.map_err(sink_err(&self.dir))?;
        let final_path = unique_path(&self.dir, &sanitize_file_name(&file.name)).await;
        let temp_path = {
            let mut name = final_path.as_os_str().to_owned();
            name.push(".spacedrop-tmp");
            PathBuf::from(name)
        };
        debug!(event = "sink_open", path = %final_path.display(), "Opening delivery target");
        Ok(Box::new(FileSinkWriter {
            temp_path,
            final_path,
            file: None,
            written: 0,
        }))
    }
}

struct FileSinkWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<BufWriter<fs::File>>,
    written: u64,
}

fn sink_err(path: &Path) -> impl Fn(std::io::Error) -> TransferError + '_ {
    move |e| TransferError::Sink(format!("{}: {e}", path.display()))
}

#[async_trait]
impl SinkWriter for FileSinkWriter {
    async fn ready_to_stream(&mut self) -> Result<()> {
        if self.file.is_none() {
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.temp_path)
                .await
                .map_err(sink_err(&self.temp_path))?;
            self.file = Some(BufWriter::new(file));
        }
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(TransferError::Sink("write before ready_to_stream".into()));
        };
        file.write_all(&data)
            .await
            .map_err(sink_err(&self.temp_path))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Err(TransferError::Sink("close before ready_to_stream".into()));
        };
        file.flush().await.map_err(sink_err(&self.temp_path))?;
        file.get_ref()
            .sync_all()
            .await
            .map_err(sink_err(&self.temp_path))?;
        drop(file);

        if let Err(e) = fs::rename(&self.temp_path, &self.final_path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(TransferError::Sink(format!(
                "failed to rename {} to {}: {e}",
                self.temp_path.display(),
                self.final_path.display()
            )));
        }
        info!(
            event = "file_delivered",
            path = %self.final_path.display(),
            bytes = self.written,
            "File written"
        );
        Ok(())
    }
}

/// Reduce a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')'))
        .collect();
    let safe = safe.trim_start_matches('.').trim().to_string();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// `dir/name`, or `dir/stem (n).ext` if that already exists.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

// ── In-memory sink ───────────────────────────────────────────────────────────

/// Collects delivered files by name. Useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    delivered: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.delivered.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl DeliverySink for MemorySink {
    async fn open(&self, file: &FileMetadata) -> Result<Box<dyn SinkWriter>> {
        Ok(Box::new(MemorySinkWriter {
            name: file.name.clone(),
            buf: Vec::with_capacity(usize::try_from(file.size).unwrap_or(0)),
            ready: false,
            delivered: self.delivered.clone(),
        }))
    }
}

struct MemorySinkWriter {
    name: String,
    buf: Vec<u8>,
    ready: bool,
    delivered: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl SinkWriter for MemorySinkWriter {
    async fn ready_to_stream(&mut self) -> Result<()> {
        self.ready = true;
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        if !self.ready {
            return Err(TransferError::Sink("write before ready_to_stream".into()));
        }
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let body = std::mem::take(&mut self.buf);
        self.delivered.lock().await.insert(self.name.clone(), body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata {
            id: "id".into(),
            device_id: "holder".into(),
            name: name.into(),
            content_type: "text/plain".into(),
            size: 5,
            thumbnail: None,
        }
    }

    #[test]
    fn sanitize_strips_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("a<b>c.txt"), "abc.txt");
    }

    #[tokio::test]
    async fn file_sink_commits_and_avoids_collisions() {
        let dir = std::env::temp_dir().join(format!("spacedrop_test_sink_{}", Uuid::new_v4()));
        let sink = FileSink::new(&dir);

        for body in [&b"first"[..], &b"again"[..]] {
            let mut w = sink.open(&meta("hello.txt")).await.unwrap();
            w.ready_to_stream().await.unwrap();
            w.write(Bytes::copy_from_slice(body)).await.unwrap();
            w.close().await.unwrap();
        }

        assert_eq!(std::fs::read(dir.join("hello.txt")).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.join("hello (1).txt")).unwrap(), b"again");
        assert!(!dir.join("hello.txt.spacedrop-tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn writes_require_ready() {
        let sink = MemorySink::new();
        let mut w = sink.open(&meta("a.txt")).await.unwrap();
        assert!(w.write(Bytes::from_static(b"x")).await.is_err());
        w.ready_to_stream().await.unwrap();
        w.write(Bytes::from_static(b"xy")).await.unwrap();
        w.close().await.unwrap();
        assert_eq!(sink.get("a.txt").await.unwrap(), b"xy");
    }
}
