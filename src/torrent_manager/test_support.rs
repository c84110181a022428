// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory collaborators for controller tests.

use crate::errors::{ResumeError, StorageError, TrackerError};
use crate::resume::{ResumeSnapshot, ResumeStore};
use crate::torrent_manager::piece_manager::PieceStateTable;
use crate::torrent_manager::{
    HashStore, LifecycleEvent, LifecycleSink, PieceCheck, PieceEntry, PieceTable,
    ProgressRecord, ProgressSink, TorrentId, TrackerSupervisor,
};
use crate::tracker::TrackerRef;

use async_trait::async_trait;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

/// Shared record of collaborator calls in the order they happened.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn note(journal: &Option<Journal>, entry: String) {
    if let Some(journal) = journal {
        journal.lock().unwrap().push(entry);
    }
}

#[derive(Default)]
pub struct FakeHashStore {
    wrong: HashSet<u32>,
    fail_allocate: bool,
    verify_delay: Option<Duration>,
    pub allocate_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
}

impl FakeHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wrong_pieces(indices: &[u32]) -> Self {
        Self {
            wrong: indices.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn failing_allocate() -> Self {
        Self {
            fail_allocate: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            verify_delay: Some(delay),
            ..Default::default()
        }
    }
}

#[async_trait]
impl HashStore for FakeHashStore {
    async fn allocate(&self, _torrent_id: TorrentId) -> Result<(), StorageError> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_allocate {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }

    async fn verify_piece(
        &self,
        _torrent_id: TorrentId,
        index: u32,
    ) -> Result<PieceCheck, StorageError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.verify_delay {
            sleep(delay).await;
        }
        if self.wrong.contains(&index) {
            Ok(PieceCheck::WrongHash)
        } else {
            Ok(PieceCheck::Ok)
        }
    }
}

pub struct FakeResumeStore {
    snapshot: ResumeSnapshot,
}

impl FakeResumeStore {
    pub fn new(snapshot: ResumeSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl ResumeStore for FakeResumeStore {
    async fn query_state(&self, _torrent_id: TorrentId) -> Result<ResumeSnapshot, ResumeError> {
        Ok(self.snapshot.clone())
    }
}

/// Piece table that notes each commit before delegating.
pub struct JournalingPieceTable {
    pub inner: PieceStateTable,
    journal: Option<Journal>,
}

impl JournalingPieceTable {
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            inner: PieceStateTable::new(),
            journal,
        }
    }
}

#[async_trait]
impl PieceTable for JournalingPieceTable {
    async fn add_pieces(&self, torrent_id: TorrentId, pieces: Vec<PieceEntry>) {
        note(&self.journal, format!("pieces:{}", torrent_id));
        self.inner.add_pieces(torrent_id, pieces).await
    }

    async fn is_fetched(&self, torrent_id: TorrentId, index: u32) -> bool {
        self.inner.is_fetched(torrent_id, index).await
    }

    async fn list_indices(&self, torrent_id: TorrentId) -> Vec<u32> {
        self.inner.list_indices(torrent_id).await
    }

    async fn fetched_indices(&self, torrent_id: TorrentId) -> Vec<u32> {
        self.inner.fetched_indices(torrent_id).await
    }
}

#[derive(Default)]
pub struct RecordingProgressSink {
    pub records: Mutex<Vec<(TorrentId, ProgressRecord)>>,
    journal: Option<Journal>,
}

impl RecordingProgressSink {
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            journal,
        }
    }
}

impl ProgressSink for RecordingProgressSink {
    fn publish(&self, torrent_id: TorrentId, record: ProgressRecord) {
        note(&self.journal, format!("progress:{}", torrent_id));
        self.records.lock().unwrap().push((torrent_id, record));
    }
}

#[derive(Default)]
pub struct RecordingLifecycleSink {
    pub events: Mutex<Vec<(TorrentId, LifecycleEvent)>>,
    journal: Option<Journal>,
}

impl RecordingLifecycleSink {
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            journal,
        }
    }

    pub fn events_for(&self, torrent_id: TorrentId) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == torrent_id)
            .map(|(_, e)| *e)
            .collect()
    }
}

impl LifecycleSink for RecordingLifecycleSink {
    fn notify(&self, torrent_id: TorrentId, event: LifecycleEvent) {
        note(&self.journal, format!("lifecycle:{:?}:{}", event, torrent_id));
        self.events.lock().unwrap().push((torrent_id, event));
    }
}

#[derive(Default)]
pub struct FakeTrackerSupervisor {
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    fail_start: bool,
    journal: Option<Journal>,
}

impl FakeTrackerSupervisor {
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TrackerSupervisor for FakeTrackerSupervisor {
    async fn start_tracker_for(
        &self,
        _parent: &broadcast::Sender<()>,
        url: &str,
        _info_hash: &[u8],
        _peer_id: &str,
        torrent_id: TorrentId,
    ) -> Result<TrackerRef, TrackerError> {
        if self.fail_start {
            return Err(TrackerError::UnsupportedUrl(url.to_string()));
        }
        note(&self.journal, format!("tracker:{}", torrent_id));
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(TrackerRef::detached(torrent_id, url))
    }

    async fn notify_completed(&self, _tracker: &TrackerRef) -> Result<(), TrackerError> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
