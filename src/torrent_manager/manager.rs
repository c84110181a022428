// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::admission_gate::{Admission, AdmissionPermit};
use crate::errors::{AdmissionError, ControllerError};

use crate::torrent_manager::reconcile::{find_bad_pieces, reconcile, Reconciled, TorrentGeometry};
use crate::torrent_manager::state::{Action, ControllerState, Effect};
use crate::torrent_manager::{
    ControllerCommand, ControllerParameters, Services, TorrentId, TorrentStatus,
};

use crate::torrent_file::Torrent;
use crate::tracker::TrackerRef;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};

use tracing::{event, Level};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Reconciled, ControllerError>> + Send>>;

/// Drives one torrent from admission through verification to `Started`.
pub struct TorrentController {
    state: ControllerState,

    torrent: Torrent,
    geometry: TorrentGeometry,
    info_hash: Vec<u8>,
    peer_id: String,

    services: Services,
    admission_retry: Duration,

    command_rx: Receiver<ControllerCommand>,
    status_tx: watch::Sender<TorrentStatus>,
    shutdown_tx: broadcast::Sender<()>,

    // Parent of everything this instance starts; dropped when `run` returns.
    scope_tx: broadcast::Sender<()>,

    permit: Option<AdmissionPermit>,
    retry_at: Option<Instant>,
    reconciliation: Option<ReconcileFuture>,
    tracker_ref: Option<TrackerRef>,
    stopped: bool,
}

impl TorrentController {
    pub fn new(params: ControllerParameters) -> Result<Self, ControllerError> {
        let ControllerParameters {
            torrent_id,
            torrent,
            info_hash,
            peer_id,
            services,
            admission_retry,
            command_rx,
            status_tx,
            shutdown_tx,
        } = params;

        let geometry = TorrentGeometry::from_torrent(&torrent)?;
        let (scope_tx, _) = broadcast::channel(1);

        event!(
            Level::INFO,
            torrent_id = %torrent_id,
            name = %torrent.info.name,
            pieces = geometry.piece_count(),
            total = geometry.total,
            "Controller created."
        );

        Ok(Self {
            state: ControllerState::new(torrent_id),
            torrent,
            geometry,
            info_hash,
            peer_id,
            services,
            admission_retry,
            command_rx,
            status_tx,
            shutdown_tx,
            scope_tx,
            permit: None,
            retry_at: None,
            reconciliation: None,
            tracker_ref: None,
            stopped: false,
        })
    }

    fn torrent_id(&self) -> TorrentId {
        self.state.torrent_id
    }

    pub async fn run(mut self) -> Result<(), ControllerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.apply_action(Action::Start).await?;

        while !self.stopped {
            let retry_deadline = self.retry_at;
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    self.apply_action(Action::Shutdown).await?;
                }

                command = self.command_rx.recv() => {
                    let action = match command {
                        Some(ControllerCommand::CheckTorrent) => Action::CheckTorrent,
                        Some(ControllerCommand::Completed) => Action::Completed,
                        Some(ControllerCommand::Shutdown) | None => Action::Shutdown,
                    };
                    self.apply_action(action).await?;
                }

                result = next_reconciliation(&mut self.reconciliation), if self.reconciliation.is_some() => {
                    self.reconciliation = None;
                    match result {
                        Ok(reconciled) => {
                            self.apply_action(Action::ReconciliationDone(Box::new(reconciled))).await?;
                        }
                        Err(e) => {
                            event!(Level::ERROR, torrent_id = %self.torrent_id(), error = %e, "Verification failed; torrent stays initializing.");
                            return Err(e);
                        }
                    }
                }

                _ = sleep_until(retry_deadline.unwrap_or_else(Instant::now)), if retry_deadline.is_some() => {
                    self.retry_at = None;
                    self.apply_action(Action::RetryElapsed).await?;
                }
            }
        }

        event!(Level::DEBUG, torrent_id = %self.torrent_id(), "Controller stopped.");
        Ok(())
    }

    // Apply actions to update state and execute the resulting effects. Effects
    // that complete a round trip feed their follow-up action back in.
    async fn apply_action(&mut self, action: Action) -> Result<(), ControllerError> {
        let mut pending = VecDeque::from([action]);
        while let Some(action) = pending.pop_front() {
            for effect in self.state.update(action) {
                if let Some(next) = self.handle_effect(effect).await? {
                    pending.push_back(next);
                }
            }
        }
        Ok(())
    }

    async fn handle_effect(&mut self, effect: Effect) -> Result<Option<Action>, ControllerError> {
        let torrent_id = self.torrent_id();
        match effect {
            Effect::RequestAdmission => {
                match self.services.admission.try_acquire(torrent_id).await {
                    Ok(Admission::Granted(permit)) => {
                        event!(Level::INFO, torrent_id = %permit.torrent_id(), "Admitted to verification.");
                        self.permit = Some(permit);
                        return Ok(Some(Action::AdmissionGranted));
                    }
                    Ok(Admission::Denied { holders }) => {
                        event!(Level::DEBUG, torrent_id = %torrent_id, holders = ?holders, "Verification slot busy.");
                        return Ok(Some(Action::AdmissionDenied { holders }));
                    }
                    Err(AdmissionError::GateShutdown) => {
                        event!(Level::DEBUG, torrent_id = %torrent_id, "Admission gate is gone; stopping.");
                        return Ok(Some(Action::Shutdown));
                    }
                }
            }

            Effect::ScheduleRetry => {
                event!(
                    Level::DEBUG,
                    torrent_id = %torrent_id,
                    attempts = self.state.denied_attempts,
                    retry_ms = self.admission_retry.as_millis() as u64,
                    "Retrying admission later."
                );
                self.retry_at = Some(Instant::now() + self.admission_retry);
            }

            Effect::EmitLifecycle(lifecycle_event) => {
                self.services
                    .lifecycle_sink
                    .notify(torrent_id, lifecycle_event);
            }

            Effect::RunReconciliation => {
                let geometry = self.geometry.clone();
                let hash_store = self.services.hash_store.clone();
                let resume_store = self.services.resume_store.clone();
                self.reconciliation = Some(Box::pin(async move {
                    reconcile(
                        torrent_id,
                        &geometry,
                        hash_store.as_ref(),
                        resume_store.as_ref(),
                    )
                    .await
                }));
            }

            Effect::CommitPieces(pieces) => {
                self.services.piece_table.add_pieces(torrent_id, pieces).await;
            }

            Effect::PublishProgress(record) => {
                event!(
                    Level::INFO,
                    torrent_id = %torrent_id,
                    downloaded = record.downloaded,
                    left = record.left,
                    total = record.total,
                    "Verification finished."
                );
                self.services.progress_sink.publish(torrent_id, record);
            }

            Effect::SetStatusStarted => {
                self.status_tx.send_replace(TorrentStatus::Started);
            }

            Effect::StartTracker => match self.torrent.tracker_url() {
                Some(url) => {
                    let started = self
                        .services
                        .tracker_supervisor
                        .start_tracker_for(
                            &self.scope_tx,
                            &url,
                            &self.info_hash,
                            &self.peer_id,
                            torrent_id,
                        )
                        .await;
                    match started {
                        Ok(tracker) => {
                            event!(Level::DEBUG, torrent_id = %tracker.torrent_id(), tracker = %tracker.url(), "Tracker attached.");
                            self.tracker_ref = Some(tracker);
                        }
                        Err(e) => {
                            // The controller exits here, so Started would outlive it.
                            self.status_tx.send_replace(TorrentStatus::Initializing);
                            return Err(e.into());
                        }
                    }
                }
                None => {
                    event!(Level::INFO, torrent_id = %torrent_id, "No tracker URL; running trackerless.");
                }
            },

            Effect::ReleaseScratch => {
                self.reconciliation = None;
                self.permit = None;
            }

            Effect::RecheckPieces => {
                match find_bad_pieces(
                    torrent_id,
                    self.services.hash_store.as_ref(),
                    self.services.piece_table.as_ref(),
                )
                .await
                {
                    Ok(bad) => {
                        for index in &bad {
                            event!(Level::WARN, torrent_id = %torrent_id, piece = index, "Piece failed re-check.");
                        }
                        event!(Level::INFO, torrent_id = %torrent_id, bad = bad.len(), "Re-check finished.");
                    }
                    Err(e) => {
                        event!(Level::ERROR, torrent_id = %torrent_id, error = %e, "Re-check could not read pieces.");
                    }
                }
            }

            Effect::NotifyTrackerCompleted => match &self.tracker_ref {
                Some(tracker) => {
                    if let Err(e) = self.services.tracker_supervisor.notify_completed(tracker).await {
                        event!(Level::WARN, torrent_id = %torrent_id, error = %e, "Tracker completion notice failed.");
                    }
                }
                None => {
                    event!(Level::DEBUG, torrent_id = %torrent_id, "Completed without a tracker.");
                }
            },

            Effect::Ignore { phase, action } => {
                event!(Level::WARN, torrent_id = %torrent_id, ?phase, action, "Ignoring unexpected event.");
            }

            Effect::Stop => {
                self.stopped = true;
                self.reconciliation = None;
                self.retry_at = None;
                self.permit = None;
                let _ = self.scope_tx.send(());
            }
        }
        Ok(None)
    }
}

async fn next_reconciliation(
    slot: &mut Option<ReconcileFuture>,
) -> Result<Reconciled, ControllerError> {
    match slot {
        Some(reconciliation) => reconciliation.await,
        None => std::future::pending().await,
    }
}
