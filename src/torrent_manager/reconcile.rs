// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Piece-state reconciliation and byte accounting.
//!
//! Three sources can say which pieces are already on disk: nothing (a fresh
//! file), a fast-resume snapshot, or a full rehash. Exactly one of them is
//! consulted per start, chosen by what the resume store returns.

use crate::errors::{ControllerError, StorageError};
use crate::resume::{decode_bitfield, ResumeSnapshot, ResumeStatus, ResumeStore};
use crate::torrent_file::{Torrent, HASH_LENGTH};
use crate::torrent_manager::{
    HashStore, PieceCheck, PieceEntry, PieceState, PieceTable, ProgressRecord, TorrentId,
};

use tracing::{event, Level};

/// Piece geometry of one torrent, validated once up front.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentGeometry {
    pub piece_length: u64,
    pub total: u64,
    pub piece_hashes: Vec<[u8; HASH_LENGTH]>,
}

impl TorrentGeometry {
    pub fn from_torrent(torrent: &Torrent) -> Result<Self, ControllerError> {
        torrent.check_geometry().map_err(ControllerError::Metadata)?;
        Ok(Self {
            piece_length: torrent.piece_length(),
            total: torrent.declared_length(),
            piece_hashes: torrent.piece_hashes(),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_size(&self, index: u32) -> u64 {
        piece_size(index, self.piece_count(), self.piece_length, self.total)
    }
}

/// Every piece spans `piece_length` bytes except the last, which carries
/// the remainder of `total` (a full piece when the remainder is zero).
pub fn piece_size(index: u32, piece_count: usize, piece_length: u64, total: u64) -> u64 {
    if piece_count > 0 && index as usize == piece_count - 1 {
        match total % piece_length {
            0 => piece_length,
            remainder => remainder,
        }
    } else {
        piece_length
    }
}

/// Result of a successful reconciliation, not yet committed anywhere.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub pieces: Vec<PieceEntry>,
    pub progress: ProgressRecord,
}

pub async fn reconcile(
    torrent_id: TorrentId,
    geometry: &TorrentGeometry,
    hash_store: &dyn HashStore,
    resume_store: &dyn ResumeStore,
) -> Result<Reconciled, ControllerError> {
    hash_store.allocate(torrent_id).await?;

    let snapshot = resume_store.query_state(torrent_id).await?;
    let fetched = fetched_flags(torrent_id, geometry, &snapshot, hash_store).await?;

    let pieces = build_piece_table(geometry, &fetched);
    let progress = compute_progress(geometry, &fetched, &snapshot)?;

    Ok(Reconciled { pieces, progress })
}

async fn fetched_flags(
    torrent_id: TorrentId,
    geometry: &TorrentGeometry,
    snapshot: &ResumeSnapshot,
    hash_store: &dyn HashStore,
) -> Result<Vec<bool>, ControllerError> {
    let piece_count = geometry.piece_count();
    match &snapshot.status {
        ResumeStatus::Seeding => {
            event!(Level::INFO, torrent_id = %torrent_id, "Resuming as seed; skipping rehash.");
            Ok(vec![true; piece_count])
        }
        ResumeStatus::Bitfield(bytes) => {
            event!(Level::INFO, torrent_id = %torrent_id, "Resuming from stored bitfield.");
            Ok(decode_bitfield(bytes, piece_count)?)
        }
        ResumeStatus::Unknown => {
            event!(Level::INFO, torrent_id = %torrent_id, pieces = piece_count, "No resume data; hashing every piece.");
            let mut fetched = Vec::with_capacity(piece_count);
            for index in 0..piece_count as u32 {
                let check = hash_store.verify_piece(torrent_id, index).await?;
                fetched.push(check == PieceCheck::Ok);
            }
            Ok(fetched)
        }
    }
}

pub fn build_piece_table(geometry: &TorrentGeometry, fetched: &[bool]) -> Vec<PieceEntry> {
    geometry
        .piece_hashes
        .iter()
        .zip(fetched)
        .enumerate()
        .map(|(index, (hash, &is_fetched))| PieceEntry {
            index: index as u32,
            expected_hash: *hash,
            length: geometry.piece_size(index as u32),
            state: if is_fetched {
                PieceState::Fetched
            } else {
                PieceState::NotFetched
            },
        })
        .collect()
}

/// Byte accounting for a reconciled table. `downloaded` above `total` is a
/// consistency failure and is reported, never clamped.
pub fn compute_progress(
    geometry: &TorrentGeometry,
    fetched: &[bool],
    snapshot: &ResumeSnapshot,
) -> Result<ProgressRecord, ControllerError> {
    let downloaded: u64 = fetched
        .iter()
        .enumerate()
        .filter(|(_, is_fetched)| **is_fetched)
        .map(|(index, _)| geometry.piece_size(index as u32))
        .sum();

    let total = geometry.total;
    if downloaded > total {
        return Err(ControllerError::ProgressInvariant { downloaded, total });
    }

    Ok(ProgressRecord {
        uploaded: 0,
        downloaded,
        all_time_uploaded: snapshot.all_time_uploaded,
        all_time_downloaded: snapshot.all_time_downloaded,
        left: total - downloaded,
        total,
    })
}

/// Rehashes every piece the table marks as fetched and returns those that
/// no longer match. Nothing is modified.
pub async fn find_bad_pieces(
    torrent_id: TorrentId,
    hash_store: &dyn HashStore,
    piece_table: &dyn PieceTable,
) -> Result<Vec<u32>, StorageError> {
    let mut bad = Vec::new();
    let mut checked = 0usize;
    for index in piece_table.list_indices(torrent_id).await {
        if !piece_table.is_fetched(torrent_id, index).await {
            continue;
        }
        checked += 1;
        if hash_store.verify_piece(torrent_id, index).await? == PieceCheck::WrongHash {
            bad.push(index);
        }
    }
    event!(Level::DEBUG, torrent_id = %torrent_id, checked, bad = bad.len(), "Fetched pieces rehashed.");
    Ok(bad)
}
