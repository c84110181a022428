// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::admission_gate::{AdmissionClient, AdmissionGate};
use crate::config::{self, Settings};
use crate::errors::{AppError, ControllerError};
use crate::integrations::cli::load_torrent_file;
use crate::integrations::lifecycle::LifecycleBus;
use crate::integrations::status::{self, AppOutputState, ProgressBoard, TorrentOutputState};
use crate::integrations::watcher;
use crate::resume::{encode_bitfield, FileResumeStore, ResumeSnapshot, ResumeStatus};
use crate::storage::DiskStore;
use crate::torrent_file::Torrent;
use crate::torrent_manager::piece_manager::PieceStateTable;
use crate::torrent_manager::registry::{ControllerRegistry, ControllerSpawner};
use crate::torrent_manager::{PieceTable, Services, TorrentId, TorrentStatus};
use crate::tracker::TrackerHub;

use notify::{Error as NotifyError, Event, EventKind};
use rand::Rng;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};

use tracing::{event as tracing_event, Level};

const LIFECYCLE_BUS_CAPACITY: usize = 64;
const WATCHER_CHANNEL_CAPACITY: usize = 100;
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_DUMP_INTERVAL: Duration = Duration::from_secs(30);

pub const RESUME_FILE_NAME: &str = "fast_resume.toml";

/// Work requested through files dropped into the watch folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    AddTorrentFromFile(PathBuf),
    AddTorrentFromPathFile(PathBuf),
    RequestCheck(PathBuf),
    NotifyCompleted(PathBuf),
    RemoveTorrent(PathBuf),
    ReloadSettings(PathBuf),
    ClientShutdown(PathBuf),
}

struct TorrentEntry {
    name: String,
    info_hash: Vec<u8>,
    last_status: TorrentStatus,
    last_error: Option<String>,
}

pub struct App {
    settings: Settings,
    data_dir: PathBuf,
    peer_id: String,
    started_at: Instant,

    admission: AdmissionClient,
    disk_store: Arc<DiskStore>,
    resume_store: Arc<FileResumeStore>,
    piece_table: Arc<PieceStateTable>,
    progress_board: Arc<ProgressBoard>,
    lifecycle_bus: Arc<LifecycleBus>,
    tracker_hub: Arc<TrackerHub>,

    spawner: ControllerSpawner,
    registry: ControllerRegistry,
    torrents: BTreeMap<TorrentId, TorrentEntry>,
    next_id: u64,

    shutdown_tx: broadcast::Sender<()>,
}

fn effective_permits(settings: &Settings) -> usize {
    if settings.admission_permits == 0 {
        tracing_event!(
            Level::WARN,
            "admission_permits is 0, no torrent could ever verify. Using 1."
        );
        1
    } else {
        settings.admission_permits
    }
}

fn remove_command_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing_event!(Level::WARN, "Failed to remove command file {:?}: {}", path, e);
    }
}

impl App {
    pub async fn new(settings: Settings, data_dir: PathBuf) -> Result<Self, AppError> {
        let (shutdown_tx, _) = broadcast::channel(1);

        config::create_watch_directories(&data_dir)?;

        let (admission_gate, admission) =
            AdmissionGate::new(effective_permits(&settings), shutdown_tx.clone());
        tokio::spawn(admission_gate.run());

        let disk_store = Arc::new(DiskStore::new());
        let resume_store = Arc::new(FileResumeStore::load(&data_dir.join(RESUME_FILE_NAME)).await?);
        let piece_table = Arc::new(PieceStateTable::new());
        let progress_board = Arc::new(ProgressBoard::new());
        let lifecycle_bus = Arc::new(LifecycleBus::new(LIFECYCLE_BUS_CAPACITY));
        let tracker_hub = Arc::new(TrackerHub::new());

        let services = Services {
            admission: admission.clone(),
            hash_store: disk_store.clone(),
            resume_store: resume_store.clone(),
            piece_table: piece_table.clone(),
            progress_sink: progress_board.clone(),
            lifecycle_sink: lifecycle_bus.clone(),
            tracker_supervisor: tracker_hub.clone(),
        };
        let spawner =
            ControllerSpawner::new(services, settings.admission_retry(), shutdown_tx.clone());

        Ok(Self {
            peer_id: settings.client_id.clone(),
            settings,
            data_dir,
            started_at: Instant::now(),
            admission,
            disk_store,
            resume_store,
            piece_table,
            progress_board,
            lifecycle_bus,
            tracker_hub,
            spawner,
            registry: ControllerRegistry::new(),
            torrents: BTreeMap::new(),
            next_id: 1,
            shutdown_tx,
        })
    }

    /// Starts every torrent listed in the settings. A torrent that fails to
    /// load is logged and skipped.
    pub async fn start_configured_torrents(&mut self) {
        for torrent_settings in self.settings.torrents.clone() {
            let download_dir = self.settings.download_dir_for(&torrent_settings);
            if let Err(e) = self
                .add_torrent_file(&torrent_settings.torrent_file, &download_dir)
                .await
            {
                tracing_event!(Level::ERROR, "Skipping configured torrent: {}", e);
            }
        }
    }

    pub async fn add_torrent_file(
        &mut self,
        path: &Path,
        download_dir: &Path,
    ) -> Result<TorrentId, AppError> {
        let torrent = load_torrent_file(path).await?;
        self.start_torrent(torrent, download_dir).await
    }

    fn torrent_by_info_hash(&self, info_hash: &[u8]) -> Option<TorrentId> {
        self.torrents
            .iter()
            .find(|(_, entry)| entry.info_hash == info_hash)
            .map(|(&torrent_id, _)| torrent_id)
    }

    pub async fn start_torrent(
        &mut self,
        torrent: Torrent,
        download_dir: &Path,
    ) -> Result<TorrentId, AppError> {
        let info_hash = torrent.info_hash();
        if let Some(existing_id) = self.torrent_by_info_hash(&info_hash) {
            tracing_event!(
                Level::INFO,
                "Ignoring already present torrent: {}",
                torrent.info.name
            );
            return Ok(existing_id);
        }

        let torrent_id = TorrentId(self.next_id);
        self.next_id += 1;
        let name = torrent.info.name.clone();

        self.disk_store
            .register(torrent_id, download_dir, &torrent)
            .await;
        self.resume_store.bind(torrent_id, &info_hash).await;

        let handle = match self.spawner.start(
            torrent_id,
            torrent,
            info_hash.clone(),
            self.peer_id.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.disk_store.unregister(torrent_id).await;
                return Err(e.into());
            }
        };
        self.registry.register_control(torrent_id, handle);

        tracing_event!(
            Level::INFO,
            %torrent_id,
            info_hash = %hex::encode(&info_hash),
            download_dir = %download_dir.display(),
            "Added torrent {}",
            name
        );
        self.torrents.insert(
            torrent_id,
            TorrentEntry {
                name,
                info_hash,
                last_status: TorrentStatus::Initializing,
                last_error: None,
            },
        );
        Ok(torrent_id)
    }

    /// Stops the torrent's controller and forgets it. Its resume snapshot
    /// is kept, so adding it again later skips the full rehash.
    pub async fn remove_torrent(&mut self, torrent_id: TorrentId) -> Result<(), AppError> {
        let entry = self
            .torrents
            .remove(&torrent_id)
            .ok_or(ControllerError::NotRegistered(torrent_id))?;

        if let Err(e) = self.registry.stop(torrent_id).await {
            tracing_event!(Level::DEBUG, %torrent_id, error = %e, "Controller ended with an error.");
        }
        self.record_snapshot(torrent_id, &entry.info_hash).await;
        self.piece_table.remove(torrent_id).await;
        self.disk_store.unregister(torrent_id).await;

        tracing_event!(Level::INFO, %torrent_id, "Removed torrent {}", entry.name);
        Ok(())
    }

    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.torrents.keys().copied().collect()
    }

    pub fn status(&self, torrent_id: TorrentId) -> Option<TorrentStatus> {
        self.registry
            .status(torrent_id)
            .or_else(|| self.torrents.get(&torrent_id).map(|t| t.last_status))
    }

    #[cfg(test)]
    pub fn subscribe_status(
        &self,
        torrent_id: TorrentId,
    ) -> Option<tokio::sync::watch::Receiver<TorrentStatus>> {
        self.registry
            .handle(torrent_id)
            .map(|handle| handle.subscribe_status())
    }

    pub async fn request_check(&self, torrent_id: TorrentId) -> Result<(), AppError> {
        Ok(self.registry.request_check(torrent_id).await?)
    }

    pub async fn notify_completed(&self, torrent_id: TorrentId) -> Result<(), AppError> {
        Ok(self.registry.notify_completed(torrent_id).await?)
    }

    /// Takes over a freshly loaded configuration. The client id never
    /// changes while running.
    pub async fn apply_settings(&mut self, mut settings: Settings) {
        settings.client_id = self.settings.client_id.clone();

        if settings.admission_permits != self.settings.admission_permits {
            let permits = effective_permits(&settings);
            if let Err(e) = self.admission.update_limit(permits).await {
                tracing_event!(Level::ERROR, "Failed to update admission limit: {}", e);
            }
        }
        self.spawner.set_admission_retry(settings.admission_retry());
        self.settings = settings;

        // Already running torrents are skipped by info hash.
        self.start_configured_torrents().await;
    }

    fn default_download_dir(&self) -> PathBuf {
        self.settings
            .default_download_folder
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn move_to_processed(&self, path: &Path) {
        let (_, processed_path) = config::watch_paths(&self.data_dir);
        if let Some(file_name) = path.file_name() {
            if let Err(e) = fs::rename(path, processed_path.join(file_name)) {
                tracing_event!(Level::WARN, "Failed to move processed file {:?}: {}", path, e);
            }
        }
    }

    fn torrent_for_command_file(&self, path: &Path) -> Option<TorrentId> {
        let Some(info_hash) = watcher::info_hash_from_command_file(path) else {
            tracing_event!(Level::WARN, "Command file {:?} names no info hash.", path);
            return None;
        };
        let torrent_id = self.torrent_by_info_hash(&info_hash);
        if torrent_id.is_none() {
            tracing_event!(
                Level::WARN,
                info_hash = %hex::encode(&info_hash),
                "Command for a torrent that is not loaded."
            );
        }
        torrent_id
    }

    /// Returns true when the command asks the client to stop.
    pub async fn handle_app_command(&mut self, command: AppCommand) -> bool {
        tracing_event!(Level::DEBUG, ?command, "Handling command.");
        match command {
            AppCommand::AddTorrentFromFile(path) => {
                let download_dir = self.default_download_dir();
                match self.add_torrent_file(&path, &download_dir).await {
                    Ok(_) => self.move_to_processed(&path),
                    // Left in place; a later write to the file retries it.
                    Err(e) => {
                        tracing_event!(Level::ERROR, "Failed to add watched torrent: {}", e);
                    }
                }
            }
            AppCommand::AddTorrentFromPathFile(path) => {
                match fs::read_to_string(&path) {
                    Ok(contents) => {
                        let torrent_path = PathBuf::from(contents.trim());
                        let download_dir = self.default_download_dir();
                        if let Err(e) = self.add_torrent_file(&torrent_path, &download_dir).await {
                            tracing_event!(Level::ERROR, "Failed to add torrent: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing_event!(Level::ERROR, "Failed to read torrent path from file {:?}: {}", path, e);
                    }
                }
                self.move_to_processed(&path);
            }
            AppCommand::RequestCheck(path) => {
                if let Some(torrent_id) = self.torrent_for_command_file(&path) {
                    if let Err(e) = self.request_check(torrent_id).await {
                        tracing_event!(Level::WARN, %torrent_id, "Check request not delivered: {}", e);
                    }
                }
                remove_command_file(&path);
            }
            AppCommand::NotifyCompleted(path) => {
                if let Some(torrent_id) = self.torrent_for_command_file(&path) {
                    if let Err(e) = self.notify_completed(torrent_id).await {
                        tracing_event!(Level::WARN, %torrent_id, "Completion not delivered: {}", e);
                    }
                }
                remove_command_file(&path);
            }
            AppCommand::RemoveTorrent(path) => {
                if let Some(torrent_id) = self.torrent_for_command_file(&path) {
                    if let Err(e) = self.remove_torrent(torrent_id).await {
                        tracing_event!(Level::WARN, %torrent_id, "Removal failed: {}", e);
                    }
                }
                remove_command_file(&path);
            }
            AppCommand::ReloadSettings(path) => {
                tracing_event!(Level::INFO, "Reloading settings.");
                remove_command_file(&path);
                self.apply_settings(config::load_settings()).await;
            }
            AppCommand::ClientShutdown(path) => {
                tracing_event!(Level::INFO, "Shutdown command received via command file.");
                remove_command_file(&path);
                return true;
            }
        }
        false
    }

    /// Returns true when one of the event's files asks the client to stop.
    async fn handle_watch_event(&mut self, event: Event) -> bool {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return false;
        }
        let mut quit = false;
        for path in event.paths {
            if let Some(command) = watcher::path_to_command(&path) {
                quit |= self.handle_app_command(command).await;
            }
        }
        quit
    }

    pub async fn run(&mut self) -> Result<(), AppError> {
        let mut lifecycle_rx = self.lifecycle_bus.subscribe();
        let mut reap_interval = time::interval(REAP_INTERVAL);
        let mut dump_interval = time::interval(STATUS_DUMP_INTERVAL);
        let status_path = status::status_file_path(&self.data_dir);

        let (watch_path, _) = config::watch_paths(&self.data_dir);
        let (watch_tx, mut watch_rx) =
            mpsc::channel::<Result<Event, NotifyError>>(WATCHER_CHANNEL_CAPACITY);
        let _watcher = match watcher::create_watcher(&watch_path, watch_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing_event!(Level::ERROR, "Command folder is not watched: {}", e);
                None
            }
        };

        let mut quit = false;
        for command in watcher::scan_watch_folder(&watch_path) {
            quit |= self.handle_app_command(command).await;
        }

        while !quit {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing_event!(Level::INFO, "Ctrl+C received, shutting down.");
                    break;
                }
                notice = lifecycle_rx.recv() => match notice {
                    Ok(notice) => {
                        tracing_event!(Level::DEBUG, torrent_id = %notice.torrent_id, event = ?notice.event, "Lifecycle notice.");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing_event!(Level::WARN, skipped, "Lifecycle listener fell behind.");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(result) = watch_rx.recv() => match result {
                    Ok(event) => {
                        quit = self.handle_watch_event(event).await;
                    }
                    Err(e) => {
                        tracing_event!(Level::WARN, "Watch error: {}", e);
                    }
                },
                _ = reap_interval.tick() => {
                    self.reap_finished().await;
                }
                _ = dump_interval.tick() => {
                    let _ = status::dump(self.output_state().await, status_path.clone()).await;
                }
            }
        }

        self.shutdown().await
    }

    /// Collects controllers whose task has already ended.
    async fn reap_finished(&mut self) {
        let finished: Vec<TorrentId> = self
            .registry
            .torrent_ids()
            .into_iter()
            .filter(|id| {
                self.registry
                    .handle(*id)
                    .is_some_and(|handle| handle.is_finished())
            })
            .collect();

        for torrent_id in finished {
            let status = self.registry.status(torrent_id);
            let result = self.registry.stop(torrent_id).await;
            if let Some(entry) = self.torrents.get_mut(&torrent_id) {
                if let Some(status) = status {
                    entry.last_status = status;
                }
                if let Err(ref e) = result {
                    entry.last_error = Some(e.to_string());
                }
            }
            if let Err(e) = result {
                tracing_event!(Level::DEBUG, %torrent_id, error = %e, "Reaped controller.");
            }
        }
    }

    pub async fn output_state(&self) -> AppOutputState {
        let verifying = match self.admission.holders().await {
            Ok(holders) => holders,
            Err(e) => {
                tracing_event!(Level::DEBUG, "Admission holders unavailable: {}", e);
                Vec::new()
            }
        };

        let mut torrents = BTreeMap::new();
        for (&torrent_id, entry) in &self.torrents {
            torrents.insert(
                entry.info_hash.clone(),
                TorrentOutputState {
                    torrent_id,
                    name: entry.name.clone(),
                    status: self.status(torrent_id).unwrap_or(entry.last_status),
                    progress: self.progress_board.get(torrent_id),
                    announces: self.tracker_hub.announces_for(torrent_id).await,
                    error: entry.last_error.clone(),
                },
            );
        }

        AppOutputState {
            run_time: self.started_at.elapsed().as_secs(),
            torrents,
            verifying,
            settings: self.settings.clone(),
        }
    }

    /// Records the torrent's current piece states in the resume store.
    /// A torrent that never committed a piece table records nothing.
    async fn record_snapshot(&self, torrent_id: TorrentId, info_hash: &[u8]) {
        let indices = self.piece_table.list_indices(torrent_id).await;
        if indices.is_empty() {
            return;
        }
        let fetched_set: HashSet<u32> = self
            .piece_table
            .fetched_indices(torrent_id)
            .await
            .into_iter()
            .collect();

        let fetched: Vec<bool> = indices.iter().map(|i| fetched_set.contains(i)).collect();
        let status = if fetched.iter().all(|&f| f) {
            ResumeStatus::Seeding
        } else {
            ResumeStatus::Bitfield(encode_bitfield(&fetched))
        };
        let progress = self.progress_board.get(torrent_id).unwrap_or_default();

        self.resume_store
            .record(
                info_hash,
                &ResumeSnapshot {
                    status,
                    all_time_uploaded: progress.all_time_uploaded,
                    all_time_downloaded: progress.all_time_downloaded,
                },
            )
            .await;
    }

    /// Records a snapshot for every loaded torrent and writes the resume file.
    pub async fn persist_resume(&self) -> Result<(), AppError> {
        for (&torrent_id, entry) in &self.torrents {
            self.record_snapshot(torrent_id, &entry.info_hash).await;
        }
        self.resume_store.save().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        let output = self.output_state().await;

        let _ = self.shutdown_tx.send(());
        self.registry.stop_all().await;

        let resume_result = self.persist_resume().await;
        if let Err(ref e) = resume_result {
            tracing_event!(Level::ERROR, "Failed to save fast-resume data: {}", e);
        }
        status::dump(output, status::status_file_path(&self.data_dir)).await?;

        tracing_event!(Level::INFO, "Shutdown complete.");
        resume_result
    }
}

pub fn generate_client_id_string() -> String {
    const CLIENT_PREFIX: &str = "-SG1000-";
    const RANDOM_LEN: usize = 12;

    let mut rng = rand::rng();
    let random_chars: String = (0..RANDOM_LEN)
        .map(|_| {
            const CHARSET: &[u8] =
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{}{}", CLIENT_PREFIX, random_chars)
}
