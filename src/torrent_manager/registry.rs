// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::ControllerError;
use crate::torrent_file::Torrent;
use crate::torrent_manager::{
    ControllerCommand, ControllerParameters, Services, TorrentController, TorrentId,
    TorrentStatus,
};

use std::collections::BTreeMap;

use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use tracing::{event, Level};

const CONTROLLER_COMMAND_CAPACITY: usize = 32;

/// Caller-side handle to a running controller task.
#[derive(Debug)]
pub struct ControllerHandle {
    torrent_id: TorrentId,
    command_tx: Sender<ControllerCommand>,
    status_rx: watch::Receiver<TorrentStatus>,
    join: JoinHandle<Result<(), ControllerError>>,
}

impl ControllerHandle {
    pub fn status(&self) -> TorrentStatus {
        *self.status_rx.borrow()
    }

    #[cfg(test)]
    pub fn subscribe_status(&self) -> watch::Receiver<TorrentStatus> {
        self.status_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    async fn send(&self, command: ControllerCommand) -> Result<(), ControllerError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ControllerError::ControllerGone(self.torrent_id))
    }

    /// Asks the controller to stop and waits for its task to end.
    pub async fn stop(self) -> Result<(), ControllerError> {
        let _ = self.command_tx.send(ControllerCommand::Shutdown).await;
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                event!(Level::ERROR, torrent_id = %self.torrent_id, error = %e, "Controller task panicked.");
                Err(ControllerError::ControllerGone(self.torrent_id))
            }
        }
    }
}

/// Builds and spawns controllers wired to one set of shared services.
#[derive(Clone)]
pub struct ControllerSpawner {
    services: Services,
    admission_retry: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControllerSpawner {
    pub fn new(
        services: Services,
        admission_retry: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            services,
            admission_retry,
            shutdown_tx,
        }
    }

    /// Applies to controllers started after the call.
    pub fn set_admission_retry(&mut self, admission_retry: Duration) {
        self.admission_retry = admission_retry;
    }

    pub fn start(
        &self,
        torrent_id: TorrentId,
        torrent: Torrent,
        info_hash: Vec<u8>,
        peer_id: String,
    ) -> Result<ControllerHandle, ControllerError> {
        let (command_tx, command_rx) = mpsc::channel(CONTROLLER_COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(TorrentStatus::Initializing);

        let controller = TorrentController::new(ControllerParameters {
            torrent_id,
            torrent,
            info_hash,
            peer_id,
            services: self.services.clone(),
            admission_retry: self.admission_retry,
            command_rx,
            status_tx,
            shutdown_tx: self.shutdown_tx.clone(),
        })?;

        let join = tokio::spawn(async move {
            let result = controller.run().await;
            if let Err(ref e) = result {
                event!(Level::ERROR, torrent_id = %torrent_id, error = %e, "Controller exited with an error.");
            }
            result
        });

        Ok(ControllerHandle {
            torrent_id,
            command_tx,
            status_rx,
            join,
        })
    }
}

/// Running controllers, discoverable by torrent id.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    handles: BTreeMap<TorrentId, ControllerHandle>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_control(&mut self, torrent_id: TorrentId, handle: ControllerHandle) {
        if let Some(previous) = self.handles.insert(torrent_id, handle) {
            event!(Level::WARN, torrent_id = %torrent_id, "Replacing an existing controller registration.");
            previous.join.abort();
        }
    }

    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.handles.keys().copied().collect()
    }

    pub fn status(&self, torrent_id: TorrentId) -> Option<TorrentStatus> {
        self.handles.get(&torrent_id).map(ControllerHandle::status)
    }

    pub fn handle(&self, torrent_id: TorrentId) -> Option<&ControllerHandle> {
        self.handles.get(&torrent_id)
    }

    fn lookup(&self, torrent_id: TorrentId) -> Result<&ControllerHandle, ControllerError> {
        self.handles
            .get(&torrent_id)
            .ok_or(ControllerError::NotRegistered(torrent_id))
    }

    pub async fn request_check(&self, torrent_id: TorrentId) -> Result<(), ControllerError> {
        self.lookup(torrent_id)?
            .send(ControllerCommand::CheckTorrent)
            .await
    }

    pub async fn notify_completed(&self, torrent_id: TorrentId) -> Result<(), ControllerError> {
        self.lookup(torrent_id)?
            .send(ControllerCommand::Completed)
            .await
    }

    pub async fn stop(&mut self, torrent_id: TorrentId) -> Result<(), ControllerError> {
        let handle = self
            .handles
            .remove(&torrent_id)
            .ok_or(ControllerError::NotRegistered(torrent_id))?;
        handle.stop().await
    }

    pub async fn stop_all(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        for (torrent_id, handle) in handles {
            if let Err(e) = handle.stop().await {
                event!(Level::DEBUG, torrent_id = %torrent_id, error = %e, "Controller ended with an error.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission_gate::AdmissionGate;
    use crate::resume::ResumeSnapshot;
    use crate::torrent_file::{Info, HASH_LENGTH};
    use crate::torrent_manager::piece_manager::PieceStateTable;
    use crate::torrent_manager::test_support::{
        FakeHashStore, FakeResumeStore, FakeTrackerSupervisor, RecordingLifecycleSink,
        RecordingProgressSink,
    };
    use crate::torrent_manager::LifecycleEvent;

    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use tokio::time::{sleep, timeout};

    fn torrent() -> Torrent {
        Torrent {
            info: Info {
                name: "data.bin".to_string(),
                piece_length: 10,
                pieces: vec![0xAB; 2 * HASH_LENGTH],
                length: 20,
                ..Default::default()
            },
            announce: Some("udp://tracker.test:80".to_string()),
            ..Default::default()
        }
    }

    struct Fixture {
        spawner: ControllerSpawner,
        hash_store: Arc<FakeHashStore>,
        lifecycle: Arc<RecordingLifecycleSink>,
        tracker: Arc<FakeTrackerSupervisor>,
        _shutdown_tx: broadcast::Sender<()>,
    }

    fn fixture() -> Fixture {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (gate, admission) = AdmissionGate::new(1, shutdown_tx.clone());
        tokio::spawn(gate.run());

        let hash_store = Arc::new(FakeHashStore::new());
        let lifecycle = Arc::new(RecordingLifecycleSink::new(None));
        let tracker = Arc::new(FakeTrackerSupervisor::new(None));
        let services = Services {
            admission,
            hash_store: hash_store.clone(),
            resume_store: Arc::new(FakeResumeStore::new(ResumeSnapshot::default())),
            piece_table: Arc::new(PieceStateTable::new()),
            progress_sink: Arc::new(RecordingProgressSink::new(None)),
            lifecycle_sink: lifecycle.clone(),
            tracker_supervisor: tracker.clone(),
        };
        Fixture {
            spawner: ControllerSpawner::new(
                services,
                Duration::from_millis(20),
                shutdown_tx.clone(),
            ),
            hash_store,
            lifecycle,
            tracker,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn wait_started(registry: &ControllerRegistry, torrent_id: TorrentId) {
        let mut status_rx = registry
            .handle(torrent_id)
            .expect("not registered")
            .subscribe_status();
        timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| *s == TorrentStatus::Started),
        )
        .await
        .expect("controller never started")
        .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_route_commands() {
        let fixture = fixture();
        let mut registry = ControllerRegistry::new();
        let id = TorrentId(7);

        let handle = fixture
            .spawner
            .start(id, torrent(), vec![7; HASH_LENGTH], "peer".to_string())
            .unwrap();
        registry.register_control(id, handle);
        assert_eq!(registry.torrent_ids(), vec![id]);

        wait_started(&registry, id).await;
        assert_eq!(registry.status(id), Some(TorrentStatus::Started));

        registry.request_check(id).await.unwrap();
        registry.notify_completed(id).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while fixture.tracker.completed.load(Ordering::SeqCst) == 0
                || fixture.hash_store.verify_calls.load(Ordering::SeqCst) < 4
            {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("commands were not delivered");
        assert_eq!(
            fixture.lifecycle.events_for(id).last(),
            Some(&LifecycleEvent::Completed)
        );

        registry.stop(id).await.unwrap();
        assert!(registry.status(id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_torrent_is_an_error() {
        let mut registry = ControllerRegistry::new();
        assert!(matches!(
            registry.request_check(TorrentId(1)).await,
            Err(ControllerError::NotRegistered(TorrentId(1)))
        ));
        assert!(matches!(
            registry.notify_completed(TorrentId(1)).await,
            Err(ControllerError::NotRegistered(_))
        ));
        assert!(registry.stop(TorrentId(1)).await.is_err());
        assert_eq!(registry.status(TorrentId(1)), None);
    }

    #[tokio::test]
    async fn test_commands_to_exited_controller_fail() {
        let fixture = fixture();
        let mut registry = ControllerRegistry::new();
        let id = TorrentId(3);
        registry.register_control(
            id,
            fixture
                .spawner
                .start(id, torrent(), vec![3; HASH_LENGTH], "peer".to_string())
                .unwrap(),
        );
        wait_started(&registry, id).await;

        // Stop the task behind the registry's back.
        registry
            .handle(id)
            .unwrap()
            .send(ControllerCommand::Shutdown)
            .await
            .unwrap();
        timeout(Duration::from_secs(5), async {
            while !registry.handle(id).unwrap().is_finished() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            registry.request_check(id).await,
            Err(ControllerError::ControllerGone(_))
        ));
        registry.stop_all().await;
        assert!(registry.torrent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_metadata() {
        let fixture = fixture();
        let mut bad = torrent();
        bad.info.piece_length = 0;
        assert!(matches!(
            fixture
                .spawner
                .start(TorrentId(1), bad, vec![0; HASH_LENGTH], String::new()),
            Err(ControllerError::Metadata(_))
        ));
    }
}
