//! Maps spans of the logical piece space onto the files that back them.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::torrent::FileEntry;

/// Portion of a span that lives in a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub path: PathBuf,
    pub file_offset: u64,
    pub span_offset: usize,
    pub length: usize,
}

/// Splits `[start, start + length)` into per-file segments.
pub(crate) fn segments(files: &[FileEntry], start: u64, length: u64) -> Vec<Segment> {
    let end = start + length;
    files
        .iter()
        .filter(|file| file.length > 0 && file.offset < end && file.end() > start)
        .map(|file| {
            let from = start.max(file.offset);
            let to = end.min(file.end());
            Segment {
                path: file.path.clone(),
                file_offset: from - file.offset,
                span_offset: (from - start) as usize,
                length: (to - from) as usize,
            }
        })
        .collect()
}

/// Creates every file at its full length.
///
/// Returns true when all files already existed with the expected length, which
/// is the precondition for trusting a persisted coverage bitmap.
pub(crate) async fn allocate(root: &Path, files: &[FileEntry]) -> std::io::Result<bool> {
    let mut all_present = true;
    for file in files {
        let path = root.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let existing_len = match fs::metadata(&path).await {
            Ok(metadata) => Some(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        if existing_len != Some(file.length) {
            all_present = false;
        }

        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        handle.set_len(file.length).await?;
    }
    Ok(all_present)
}

/// Writes `data` at `start` in the piece space.
pub(crate) async fn write_span(
    root: &Path,
    files: &[FileEntry],
    start: u64,
    data: &[u8],
) -> Result<(), (PathBuf, std::io::Error)> {
    for segment in segments(files, start, data.len() as u64) {
        let path = root.join(&segment.path);
        let chunk = &data[segment.span_offset..segment.span_offset + segment.length];
        write_segment(&path, segment.file_offset, chunk)
            .await
            .map_err(|e| (path, e))?;
    }
    Ok(())
}

async fn write_segment(path: &Path, offset: u64, chunk: &[u8]) -> std::io::Result<()> {
    let mut handle = OpenOptions::new().write(true).open(path).await?;
    handle.seek(SeekFrom::Start(offset)).await?;
    handle.write_all(chunk).await?;
    handle.flush().await
}

/// Reads `length` bytes starting at `start` in the piece space.
pub(crate) async fn read_span(
    root: &Path,
    files: &[FileEntry],
    start: u64,
    length: u64,
) -> std::io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; length as usize];
    for segment in segments(files, start, length) {
        let mut handle = fs::File::open(root.join(&segment.path)).await?;
        handle.seek(SeekFrom::Start(segment.file_offset)).await?;
        handle
            .read_exact(&mut buffer[segment.span_offset..segment.span_offset + segment.length])
            .await?;
    }
    Ok(buffer)
}

/// Removes the torrent's files and any directories left empty below `root`.
pub(crate) async fn remove_files(root: &Path, paths: &[PathBuf]) -> std::io::Result<()> {
    for relative in paths {
        let path = root.join(relative);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == root || fs::remove_dir(dir).await.is_err() {
                break;
            }
            parent = dir.parent();
        }
    }
    Ok(())
}
