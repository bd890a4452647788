//! Torrent descriptor: piece manifest plus file layout.
//!
//! Descriptors normally arrive pre-built from the search/metadata layer, but
//! they can also be parsed from `.torrent` bytes using bencode-rs.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Component, PathBuf};

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use super::{BLOCK_SIZE, InfoHash, PieceIndex, TorrentError};

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// One file of the torrent, positioned inside the logical piece space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path below the download directory
    pub path: PathBuf,
    /// Byte offset of the first byte of this file in the piece space
    pub offset: u64,
    /// File length in bytes
    pub length: u64,
}

impl FileEntry {
    /// Exclusive end offset in the piece space.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Everything the engine needs to stream one torrent.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    /// Tracker announce URLs, tier order preserved
    pub trackers: Vec<String>,
    /// DHT bootstrap routers, `host:port`
    pub dht_routers: Vec<String>,
    /// File to stream; `None` selects the largest file
    pub file_index: Option<usize>,
    pub keep_after_exit: bool,
    pub creation_date: Option<DateTime<Utc>>,
}

impl TorrentDescriptor {
    /// Builds a descriptor from a file list, laying files out back to back.
    ///
    /// # Errors
    /// - `TorrentError::InvalidDescriptor` - Zero piece length, no files, or
    ///   a piece hash count that does not cover the total length
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<(PathBuf, u64)>,
    ) -> Result<Self, TorrentError> {
        let mut offset = 0u64;
        let files: Vec<FileEntry> = files
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry {
                    path,
                    offset,
                    length,
                };
                offset += length;
                entry
            })
            .collect();

        let descriptor = Self {
            info_hash,
            name: name.into(),
            piece_length,
            total_length: offset,
            piece_hashes,
            files,
            trackers: Vec::new(),
            dht_routers: Vec::new(),
            file_index: None,
            keep_after_exit: false,
            creation_date: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks that the piece manifest and file layout agree and that every
    /// file path stays below the download directory.
    ///
    /// # Errors
    /// - `TorrentError::InvalidDescriptor` - Layout and manifest disagree, or
    ///   a path is absolute or contains `..`
    pub fn validate(&self) -> Result<(), TorrentError> {
        if self.piece_length == 0 {
            return Err(TorrentError::InvalidDescriptor {
                reason: "piece length is zero".to_string(),
            });
        }
        if self.files.is_empty() || self.total_length == 0 {
            return Err(TorrentError::InvalidDescriptor {
                reason: "torrent has no content".to_string(),
            });
        }
        let expected = self.total_length.div_ceil(self.piece_length as u64);
        if expected != self.piece_hashes.len() as u64 {
            return Err(TorrentError::InvalidDescriptor {
                reason: format!(
                    "expected {expected} piece hashes, found {}",
                    self.piece_hashes.len()
                ),
            });
        }
        if let Some(file) = self.files.iter().find(|file| !is_contained_path(&file.path)) {
            return Err(TorrentError::InvalidDescriptor {
                reason: format!("file path {} escapes the download directory", file.path.display()),
            });
        }
        if let Some(index) = self.file_index
            && index >= self.files.len()
        {
            return Err(TorrentError::InvalidDescriptor {
                reason: format!("file index {index} out of range"),
            });
        }
        Ok(())
    }

    /// Sets the tracker hints.
    pub fn with_trackers(mut self, trackers: Vec<String>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Selects the file to stream.
    pub fn with_file_index(mut self, file_index: Option<usize>) -> Self {
        self.file_index = file_index;
        self
    }

    /// Marks the torrent as exempt from cache eviction.
    pub fn with_keep_after_exit(mut self, keep: bool) -> Self {
        self.keep_after_exit = keep;
        self
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Size of the given piece; only the last piece may be short.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = self.piece_offset(piece);
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    /// Number of blocks the piece is split into.
    pub fn block_count(&self, piece: PieceIndex) -> u32 {
        self.piece_size(piece).div_ceil(BLOCK_SIZE)
    }

    /// Length of the block at `offset`, or `None` if the offset is not a
    /// block boundary inside the piece.
    pub fn block_length(&self, piece: PieceIndex, offset: u32) -> Option<u32> {
        let piece_size = self.piece_size(piece);
        if offset >= piece_size || !offset.is_multiple_of(BLOCK_SIZE) {
            return None;
        }
        Some(BLOCK_SIZE.min(piece_size - offset))
    }

    /// Byte offset of the piece in the piece space.
    pub fn piece_offset(&self, piece: PieceIndex) -> u64 {
        piece.as_u32() as u64 * self.piece_length as u64
    }

    /// Expected SHA-1 of the piece.
    pub fn piece_hash(&self, piece: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(piece.as_usize())
    }

    /// Piece index containing the given byte offset.
    pub fn piece_for_offset(&self, offset: u64) -> PieceIndex {
        PieceIndex::new((offset / self.piece_length as u64) as u32)
    }

    /// Pieces intersecting the half-open byte range `[start, end)`.
    ///
    /// Returns `None` for an empty range.
    pub fn pieces_for_range(&self, start: u64, end: u64) -> Option<RangeInclusive<u32>> {
        let end = end.min(self.total_length);
        if start >= end {
            return None;
        }
        let first = self.piece_for_offset(start).as_u32();
        let last = self.piece_for_offset(end - 1).as_u32();
        Some(first..=last)
    }

    /// The file selected for playback.
    ///
    /// Uses `file_index` when set, otherwise the largest file. Ties go to the
    /// first file listed.
    pub fn selected_file(&self) -> &FileEntry {
        if let Some(file) = self.file_index.and_then(|index| self.files.get(index)) {
            return file;
        }
        let mut largest = &self.files[0];
        for file in &self.files[1..] {
            if file.length > largest.length {
                largest = file;
            }
        }
        largest
    }

    /// Parses a descriptor from `.torrent` bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    pub fn from_torrent_bytes(torrent_bytes: &[u8]) -> Result<Self, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(bencode_rs::Value::Dictionary(root)) = parsed.first() else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            });
        };

        let Some(bencode_rs::Value::Dictionary(info)) = root.get(b"info".as_slice()) else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'info' dictionary".to_string(),
            });
        };

        let info_hash = hash_info_dictionary(torrent_bytes)?;
        let name = read_string(info, b"name")?;
        let piece_length = u32::try_from(read_integer(info, b"piece length")?).map_err(|_| {
            TorrentError::InvalidTorrentFile {
                reason: "Invalid piece length".to_string(),
            }
        })?;

        let pieces = read_bytes(info, b"pieces")?;
        if !pieces.len().is_multiple_of(20) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid pieces length".to_string(),
            });
        }
        let piece_hashes = pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = if let Ok(length) = read_integer(info, b"length") {
            vec![(PathBuf::from(&name), length as u64)]
        } else if let Some(bencode_rs::Value::List(entries)) = info.get(b"files".as_slice()) {
            read_file_list(&name, entries)?
        } else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'files' or 'length' field".to_string(),
            });
        };

        let mut descriptor = Self::new(info_hash, name, piece_length, piece_hashes, files)
            .map_err(|e| TorrentError::InvalidTorrentFile {
                reason: e.to_string(),
            })?;
        descriptor.trackers = read_announce_urls(root);
        descriptor.dht_routers = read_dht_nodes(root);
        descriptor.creation_date = read_integer(root, b"creation date")
            .ok()
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0));
        Ok(descriptor)
    }

    /// Builds a single-file descriptor whose hashes match `content`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_content(name: &str, piece_length: u32, content: &[u8]) -> Self {
        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let info_hash = InfoHash::new(Sha1::digest(name.as_bytes()).into());
        Self::new(
            info_hash,
            name,
            piece_length,
            piece_hashes,
            vec![(PathBuf::from(name), content.len() as u64)],
        )
        .expect("test content produces a valid descriptor")
    }
}

/// Relative path made only of plain components.
fn is_contained_path(path: &std::path::Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// SHA-1 over the raw bencoded `info` value as it appears in the file.
fn hash_info_dictionary(torrent_bytes: &[u8]) -> ParseResult<InfoHash> {
    let info = info_value(torrent_bytes)?;
    if info.first() != Some(&b'd') {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "Expected dictionary start".to_string(),
        });
    }
    Ok(InfoHash::new(Sha1::digest(info).into()))
}

/// Raw bytes of the `info` value, found by walking the root dictionary's keys.
fn info_value(torrent_bytes: &[u8]) -> ParseResult<&[u8]> {
    if torrent_bytes.first() != Some(&b'd') {
        return Err(TorrentError::InvalidTorrentFile {
            reason: "Root element must be dictionary".to_string(),
        });
    }

    let mut pos = 1;
    while pos < torrent_bytes.len() && torrent_bytes[pos] != b'e' {
        let (key, value_start) = read_byte_string(torrent_bytes, pos)?;
        let value_end = value_start + bencode_value_len(&torrent_bytes[value_start..])?;
        if key == b"info" {
            return Ok(&torrent_bytes[value_start..value_end]);
        }
        pos = value_end;
    }
    Err(TorrentError::InvalidTorrentFile {
        reason: "Could not find info dictionary in data".to_string(),
    })
}

/// Byte string starting at `pos`; returns its content and the position after it.
fn read_byte_string(data: &[u8], pos: usize) -> ParseResult<(&[u8], usize)> {
    let invalid = || TorrentError::InvalidTorrentFile {
        reason: "Invalid string format".to_string(),
    };
    let colon = data[pos..]
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(invalid)?;
    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| TorrentError::InvalidTorrentFile {
            reason: "Invalid string length".to_string(),
        })?;
    let start = pos + colon + 1;
    let end = start
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(invalid)?;
    Ok((&data[start..end], end))
}

/// Length of the bencoded value at the start of `data`.
fn bencode_value_len(data: &[u8]) -> ParseResult<usize> {
    let mut pos = 0;
    let mut depth = 0usize;
    loop {
        let Some(&byte) = data.get(pos) else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Incomplete bencode value".to_string(),
            });
        };
        match byte {
            b'd' | b'l' => {
                depth += 1;
                pos += 1;
            }
            b'e' if depth > 0 => {
                depth -= 1;
                pos += 1;
            }
            b'i' => {
                let end = data[pos..].iter().position(|&b| b == b'e').ok_or_else(|| {
                    TorrentError::InvalidTorrentFile {
                        reason: "Unterminated integer".to_string(),
                    }
                })?;
                pos += end + 1;
            }
            b'0'..=b'9' => {
                pos = read_byte_string(data, pos)?.1;
            }
            _ => {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid bencode character".to_string(),
                });
            }
        }
        if depth == 0 {
            return Ok(pos);
        }
    }
}

fn read_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(TorrentError::InvalidTorrentFile {
            reason: format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ),
        }),
    }
}

fn read_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
    let bytes = read_bytes(dict, key)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
        reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
    })
}

fn read_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) if *value >= 0 => Ok(*value),
        _ => Err(TorrentError::InvalidTorrentFile {
            reason: format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ),
        }),
    }
}

fn read_file_list(name: &str, entries: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<(PathBuf, u64)>> {
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let bencode_rs::Value::Dictionary(file) = entry else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid file entry type".to_string(),
            });
        };
        let length = read_integer(file, b"length")? as u64;
        let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice()) else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing or invalid path in file".to_string(),
            });
        };

        let mut path = PathBuf::from(name);
        for component in components {
            let bencode_rs::Value::Bytes(component) = component else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid path component type".to_string(),
                });
            };
            let component = std::str::from_utf8(component).map_err(|_| {
                TorrentError::InvalidTorrentFile {
                    reason: "Invalid UTF-8 in file path".to_string(),
                }
            })?;
            if component == ".." || component.contains('/') || component.contains('\\') {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: format!("Unsafe path component: {component}"),
                });
            }
            path.push(component);
        }
        files.push((path, length));
    }
    Ok(files)
}

fn read_announce_urls(root: &BencodeDict<'_>) -> Vec<String> {
    let mut urls = Vec::new();
    if let Ok(announce) = read_string(root, b"announce") {
        urls.push(announce);
    }
    if let Some(bencode_rs::Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
        for tier in tiers {
            let bencode_rs::Value::List(tier_urls) = tier else {
                continue;
            };
            for url in tier_urls {
                if let bencode_rs::Value::Bytes(bytes) = url
                    && let Ok(url) = String::from_utf8(bytes.to_vec())
                    && !urls.contains(&url)
                {
                    urls.push(url);
                }
            }
        }
    }
    urls
}

fn read_dht_nodes(root: &BencodeDict<'_>) -> Vec<String> {
    let Some(bencode_rs::Value::List(nodes)) = root.get(b"nodes".as_slice()) else {
        return Vec::new();
    };
    nodes
        .iter()
        .filter_map(|node| match node {
            bencode_rs::Value::List(pair) => match (pair.first(), pair.get(1)) {
                (Some(bencode_rs::Value::Bytes(host)), Some(bencode_rs::Value::Integer(port))) => {
                    Some(format!("{}:{port}", String::from_utf8_lossy(host)))
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}
