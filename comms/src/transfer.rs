//! Chunked file transfer.
//!
//! Large payloads (model assets, results, logs) move as bounded-size chunks
//! so neither peer ever holds a whole file in one message. The relative path
//! inside each chunk doubles as the transfer identifier; the final chunk is
//! flagged, there is no expected-total-size bookkeeping.

use std::{
    collections::HashMap,
    io::{self, SeekFrom},
    path::{Component, Path, PathBuf},
};

use log::debug;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::msg::FileChunk;

/// Upper bound on a single chunk (5 MB).
pub const MAX_FILE_CHUNK: usize = 5_000_000;

/// Receiver-side sink for incoming file chunks.
///
/// The first chunk seen for a path truncates (or creates) the destination
/// file; following chunks append. A transfer stays open until a chunk with
/// the last flag arrives, after which the same path starts a fresh transfer.
pub struct FileReceiver {
    dest_dir: PathBuf,
    open: HashMap<String, File>,
}

impl FileReceiver {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            open: HashMap::new(),
        }
    }

    /// Changes where received files land. Transfers already in progress keep
    /// writing to their original destination.
    pub fn set_dest_dir(&mut self, dest_dir: impl Into<PathBuf>) {
        self.dest_dir = dest_dir.into();
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Appends one chunk to its transfer, starting the transfer if this is
    /// the first chunk for the path.
    ///
    /// # Returns
    /// `Ok(true)` when the chunk completed the transfer.
    pub async fn add_chunk(&mut self, chunk: &FileChunk<'_>) -> io::Result<bool> {
        let rel = sanitize_rel_path(&chunk.path)?;
        let key = chunk.path.to_string();

        if !self.open.contains_key(&key) {
            let full = self.dest_dir.join(&rel);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&full)
                .await?;
            debug!("starting file transfer into {}", full.display());
            self.open.insert(key.clone(), file);
        }

        // The entry was just inserted if it was missing.
        let file = self.open.get_mut(&key).unwrap();
        file.write_all(&chunk.data).await?;

        if chunk.is_last {
            file.flush().await?;
            self.open.remove(&key);
            debug!("completed file transfer for {key}");
        }

        Ok(chunk.is_last)
    }
}

/// Reads one chunk of at most `max` bytes starting at `offset`.
///
/// The offset is caller-supplied and never assumed zero, so interrupted
/// fetches can resume. An empty last chunk is valid for a zero-length file
/// or an offset at the end of the file.
///
/// # Returns
/// The chunk bytes and whether the read reached the end of the file.
pub async fn read_chunk_at(path: &Path, offset: u64, max: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();

    if offset >= len {
        return Ok((Vec::new(), true));
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let take = usize::min(max, (len - offset) as usize);
    let mut data = vec![0; take];
    file.read_exact(&mut data).await?;

    Ok((data, offset + take as u64 >= len))
}

/// Refuses relative paths that would escape the destination directory.
pub fn sanitize_rel_path(rel: &str) -> io::Result<PathBuf> {
    let path = Path::new(rel);
    let escapes = path.components().any(|c| {
        !matches!(c, Component::Normal(_) | Component::CurDir)
    });
    if rel.is_empty() || escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing unsafe transfer path: {rel}"),
        ));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    fn chunk<'a>(path: &'a str, data: &'a [u8], is_last: bool) -> FileChunk<'a> {
        FileChunk {
            path: Cow::Borrowed(path),
            is_last,
            data: Cow::Borrowed(data),
        }
    }

    #[tokio::test]
    async fn chunks_append_until_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());

        assert!(!receiver.add_chunk(&chunk("a.bin", b"hello ", false)).await.unwrap());
        assert!(receiver.add_chunk(&chunk("a.bin", b"world", true)).await.unwrap());

        let written = std::fs::read(dir.path().join("a.bin")).unwrap();
        assert_eq!(written, b"hello world");
    }

    #[tokio::test]
    async fn new_transfer_restarts_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());

        receiver.add_chunk(&chunk("a.bin", b"old contents", true)).await.unwrap();
        receiver.add_chunk(&chunk("a.bin", b"new", true)).await.unwrap();

        let written = std::fs::read(dir.path().join("a.bin")).unwrap();
        assert_eq!(written, b"new");
    }

    #[tokio::test]
    async fn escaping_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());

        let err = receiver
            .add_chunk(&chunk("../outside.bin", b"x", true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = receiver
            .add_chunk(&chunk("/etc/owned", b"x", true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn chunk_reads_resume_from_an_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(&path, &payload).unwrap();

        let (first, last) = read_chunk_at(&path, 0, 600).await.unwrap();
        assert_eq!(first, payload[..600]);
        assert!(!last);

        let (rest, last) = read_chunk_at(&path, 600, 600).await.unwrap();
        assert_eq!(rest, payload[600..]);
        assert!(last);
    }

    #[tokio::test]
    async fn empty_file_yields_an_empty_last_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let (data, last) = read_chunk_at(&path, 0, MAX_FILE_CHUNK).await.unwrap();
        assert!(data.is_empty());
        assert!(last);
    }
}
