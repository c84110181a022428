// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod manager;
pub mod piece_manager;
pub mod reconcile;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

use crate::admission_gate::AdmissionClient;
use crate::errors::{StorageError, TrackerError};
use crate::resume::ResumeStore;
use crate::torrent_file::Torrent;
use crate::tracker::TrackerRef;

use async_trait::async_trait;
use serde::Serialize;

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::time::Duration;

/// Per-process torrent identity, handed out by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TorrentId(pub u64);

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PieceState {
    #[default]
    NotFetched,
    Fetched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceEntry {
    pub index: u32,
    pub expected_hash: [u8; 20],
    pub length: u64,
    pub state: PieceState,
}

/// Outcome of hashing one piece on disk. A mismatch is a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceCheck {
    Ok,
    WrongHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressRecord {
    pub uploaded: u64,
    pub downloaded: u64,
    pub all_time_uploaded: u64,
    pub all_time_downloaded: u64,
    pub left: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleEvent {
    Checking,
    Started,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TorrentStatus {
    #[default]
    Initializing,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    CheckTorrent,
    Completed,
    Shutdown,
}

/// Expected piece hashes plus the measured on-disk result.
#[async_trait]
pub trait HashStore: Send + Sync {
    async fn allocate(&self, torrent_id: TorrentId) -> Result<(), StorageError>;

    async fn verify_piece(
        &self,
        torrent_id: TorrentId,
        index: u32,
    ) -> Result<PieceCheck, StorageError>;
}

#[async_trait]
pub trait PieceTable: Send + Sync {
    async fn add_pieces(&self, torrent_id: TorrentId, pieces: Vec<PieceEntry>);
    async fn is_fetched(&self, torrent_id: TorrentId, index: u32) -> bool;
    async fn list_indices(&self, torrent_id: TorrentId) -> Vec<u32>;
    async fn fetched_indices(&self, torrent_id: TorrentId) -> Vec<u32>;
}

pub trait ProgressSink: Send + Sync {
    fn publish(&self, torrent_id: TorrentId, record: ProgressRecord);
}

pub trait LifecycleSink: Send + Sync {
    fn notify(&self, torrent_id: TorrentId, event: LifecycleEvent);
}

#[async_trait]
pub trait TrackerSupervisor: Send + Sync {
    async fn start_tracker_for(
        &self,
        parent: &broadcast::Sender<()>,
        url: &str,
        info_hash: &[u8],
        peer_id: &str,
        torrent_id: TorrentId,
    ) -> Result<TrackerRef, TrackerError>;

    async fn notify_completed(&self, tracker: &TrackerRef) -> Result<(), TrackerError>;
}

/// The shared collaborators every controller is wired to.
#[derive(Clone)]
pub struct Services {
    pub admission: AdmissionClient,
    pub hash_store: Arc<dyn HashStore>,
    pub resume_store: Arc<dyn ResumeStore>,
    pub piece_table: Arc<dyn PieceTable>,
    pub progress_sink: Arc<dyn ProgressSink>,
    pub lifecycle_sink: Arc<dyn LifecycleSink>,
    pub tracker_supervisor: Arc<dyn TrackerSupervisor>,
}

pub struct ControllerParameters {
    pub torrent_id: TorrentId,
    pub torrent: Torrent,
    pub info_hash: Vec<u8>,
    pub peer_id: String,
    pub services: Services,
    pub admission_retry: Duration,
    pub command_rx: Receiver<ControllerCommand>,
    pub status_tx: watch::Sender<TorrentStatus>,
    pub shutdown_tx: broadcast::Sender<()>,
}

pub use manager::TorrentController;
