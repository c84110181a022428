// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::StorageError;
use crate::torrent_file::{Torrent, HASH_LENGTH};
use crate::torrent_manager::{HashStore, PieceCheck, TorrentId};

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, try_exists, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{event, Level};

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,            // Full path on disk.
    pub length: u64,              // File length in bytes.
    pub global_start_offset: u64, // Offset of this file within the torrent's data stream.
}

/// File layout of a torrent, hiding the single/multi-file distinction.
#[derive(Debug, Clone)]
pub struct MultiFileInfo {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

impl MultiFileInfo {
    pub fn new(root_dir: &Path, torrent: &Torrent) -> Self {
        if torrent.info.files.is_empty() {
            let total_size = torrent.declared_length();
            let single_file = FileInfo {
                path: root_dir.join(&torrent.info.name),
                length: total_size,
                global_start_offset: 0,
            };
            return Self {
                files: vec![single_file],
                total_size,
            };
        }

        let content_dir = root_dir.join(&torrent.info.name);
        let mut files = Vec::new();
        let mut current_offset = 0;
        for (path_components, length) in torrent.file_list() {
            let mut full_path = content_dir.clone();
            for component in &path_components {
                full_path.push(component);
            }
            files.push(FileInfo {
                path: full_path,
                length,
                global_start_offset: current_offset,
            });
            current_offset += length;
        }
        Self {
            files,
            total_size: current_offset,
        }
    }
}

/// Creates all directories and pre-allocates every file of a torrent.
/// Existing files shorter than their declared length are extended; none is
/// ever truncated.
pub async fn create_and_allocate_files(
    multi_file_info: &MultiFileInfo,
) -> Result<(), StorageError> {
    for file_info in &multi_file_info.files {
        if let Some(parent_dir) = file_info.path.parent() {
            if !try_exists(parent_dir).await? {
                fs::create_dir_all(parent_dir).await?;
            }
        }

        if !try_exists(&file_info.path).await? {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_info.path)
                .await?;
            file.set_len(file_info.length).await?;
        } else {
            let current_len = fs::metadata(&file_info.path).await?.len();
            if current_len < file_info.length {
                event!(
                    Level::DEBUG,
                    path = %file_info.path.display(),
                    current_len,
                    declared = file_info.length,
                    "Extending short file."
                );
                let file = OpenOptions::new().write(true).open(&file_info.path).await?;
                file.set_len(file_info.length).await?;
            }
        }
    }
    Ok(())
}

pub async fn read_data_from_disk(
    multi_file_info: &MultiFileInfo,
    global_offset: u64,
    bytes_to_read: usize,
) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::with_capacity(bytes_to_read);
    let mut bytes_read = 0;

    for file_info in &multi_file_info.files {
        let file_start = file_info.global_start_offset;
        let file_end = file_start + file_info.length;
        let read_start = global_offset + bytes_read as u64;

        if read_start < file_end && global_offset < file_end {
            let local_offset = read_start.saturating_sub(file_start);
            let bytes_to_read_in_this_file = std::cmp::min(
                (bytes_to_read - bytes_read) as u64,
                file_info.length - local_offset,
            ) as usize;

            if bytes_to_read_in_this_file > 0 {
                let mut file = File::open(&file_info.path).await?;
                file.seek(SeekFrom::Start(local_offset)).await?;

                let mut temp_buf = vec![0; bytes_to_read_in_this_file];
                file.read_exact(&mut temp_buf).await?;
                buffer.extend_from_slice(&temp_buf);

                bytes_read += bytes_to_read_in_this_file;
            }

            if bytes_read == bytes_to_read {
                return Ok(buffer);
            }
        }
    }

    Err(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "Failed to read all data, offset likely out of bounds",
    )))
}

#[derive(Debug, Clone)]
struct StorageLayout {
    multi_file_info: MultiFileInfo,
    piece_length: u64,
    piece_hashes: Vec<[u8; HASH_LENGTH]>,
}

/// Disk-backed hash store. Each torrent registers its layout once; after
/// that pieces are addressed by torrent id and index only.
#[derive(Default)]
pub struct DiskStore {
    layouts: RwLock<HashMap<TorrentId, Arc<StorageLayout>>>,
}

impl DiskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, torrent_id: TorrentId, download_dir: &Path, torrent: &Torrent) {
        let layout = StorageLayout {
            multi_file_info: MultiFileInfo::new(download_dir, torrent),
            piece_length: torrent.piece_length(),
            piece_hashes: torrent.piece_hashes(),
        };
        self.layouts
            .write()
            .await
            .insert(torrent_id, Arc::new(layout));
    }

    pub async fn unregister(&self, torrent_id: TorrentId) {
        self.layouts.write().await.remove(&torrent_id);
    }

    async fn layout(&self, torrent_id: TorrentId) -> Result<Arc<StorageLayout>, StorageError> {
        self.layouts
            .read()
            .await
            .get(&torrent_id)
            .cloned()
            .ok_or(StorageError::UnknownTorrent(torrent_id))
    }
}

#[async_trait]
impl HashStore for DiskStore {
    async fn allocate(&self, torrent_id: TorrentId) -> Result<(), StorageError> {
        let layout = self.layout(torrent_id).await?;
        create_and_allocate_files(&layout.multi_file_info).await
    }

    async fn verify_piece(
        &self,
        torrent_id: TorrentId,
        index: u32,
    ) -> Result<PieceCheck, StorageError> {
        let layout = self.layout(torrent_id).await?;
        let expected = *layout
            .piece_hashes
            .get(index as usize)
            .ok_or(StorageError::PieceOutOfRange { torrent_id, index })?;

        let total_size = layout.multi_file_info.total_size;
        let start_offset = index as u64 * layout.piece_length;
        let len_this_piece =
            std::cmp::min(layout.piece_length, total_size.saturating_sub(start_offset)) as usize;
        if len_this_piece == 0 {
            return Err(StorageError::PieceOutOfRange { torrent_id, index });
        }

        let piece_data =
            read_data_from_disk(&layout.multi_file_info, start_offset, len_this_piece).await?;

        let hash_task =
            tokio::task::spawn_blocking(move || Sha1::digest(&piece_data).as_slice() == expected);
        Ok(piece_check_from(hash_task.await, torrent_id, index))
    }
}

fn piece_check_from(
    hash_result: Result<bool, JoinError>,
    torrent_id: TorrentId,
    index: u32,
) -> PieceCheck {
    match hash_result {
        Ok(true) => PieceCheck::Ok,
        Ok(false) => {
            event!(Level::TRACE, torrent_id = %torrent_id, piece = index, "Piece hash mismatch.");
            PieceCheck::WrongHash
        }
        Err(e) => {
            event!(Level::ERROR, torrent_id = %torrent_id, piece = index, error = %e, "Hashing task failed; counting piece as wrong.");
            PieceCheck::WrongHash
        }
    }
}
