// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_file::parser::ParseError;
use crate::torrent_manager::TorrentId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("An I/O error occurred")]
    Io(#[from] std::io::Error),

    #[error("Torrent {0} has no registered storage layout")]
    UnknownTorrent(TorrentId),

    #[error("Piece {index} is out of range for torrent {torrent_id}")]
    PieceOutOfRange { torrent_id: TorrentId, index: u32 },
}

#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("Failed to read or write the fast-resume file")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse the fast-resume file")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize fast-resume state")]
    Serialize(#[from] toml::ser::Error),

    #[error("Stored bitfield is not valid hex")]
    Hex(#[from] hex::FromHexError),

    #[error("Bitfield has {actual} bytes, expected {expected} for {piece_count} pieces")]
    BitfieldLength {
        expected: usize,
        actual: usize,
        piece_count: usize,
    },

    #[error("Bitfield has spare bits set past piece {piece_count}")]
    BitfieldSpareBits { piece_count: usize },
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Unsupported tracker URL: {0}")]
    UnsupportedUrl(String),

    #[error("The tracker task for torrent {0} is no longer running")]
    TrackerGone(TorrentId),
}

#[derive(Error, Debug, Clone)]
pub enum AdmissionError {
    #[error("The admission gate has been shut down.")]
    GateShutdown,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Storage failure during verification: {0}")]
    Storage(#[from] StorageError),

    #[error("Fast-resume state is unusable: {0}")]
    Resume(#[from] ResumeError),

    #[error("Tracker could not be started: {0}")]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Progress invariant violated: downloaded {downloaded} exceeds total {total}")]
    ProgressInvariant { downloaded: u64, total: u64 },

    #[error("Torrent metadata is unusable: {0}")]
    Metadata(String),

    #[error("No controller is registered for torrent {0}")]
    NotRegistered(TorrentId),

    #[error("Controller for torrent {0} is no longer running")]
    ControllerGone(TorrentId),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to read torrent file {path:?}: {source}")]
    ReadTorrent {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse torrent file {path:?}: {source}")]
    ParseTorrent { path: PathBuf, source: ParseError },

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Not a 40-character hex info hash: {0}")]
    InvalidInfoHash(String),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}
