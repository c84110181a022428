// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-wide admission control for the disk-verification phase.
//!
//! The gate runs as an actor. Torrents ask for a slot with
//! [`AdmissionClient::try_acquire`], which never queues: the answer is either
//! a permit or a denial, and a denied torrent is expected to retry on its own
//! schedule. Dropping the permit hands the slot back.

use crate::errors::AdmissionError;
use crate::torrent_manager::TorrentId;

use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot};
use tracing::{event, Level};

const GATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct AdmissionPermit {
    torrent_id: TorrentId,
    control_tx: mpsc::Sender<ControlCommand>,
}

impl AdmissionPermit {
    pub fn torrent_id(&self) -> TorrentId {
        self.torrent_id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let _ = self.control_tx.try_send(ControlCommand::Release {
            torrent_id: self.torrent_id,
        });
    }
}

#[derive(Debug)]
pub enum Admission {
    Granted(AdmissionPermit),
    Denied { holders: Vec<TorrentId> },
}

#[derive(Clone, Debug)]
pub struct AdmissionClient {
    acquire_tx: mpsc::Sender<AcquireCommand>,
    control_tx: mpsc::Sender<ControlCommand>,
}

impl AdmissionClient {
    pub async fn try_acquire(&self, torrent_id: TorrentId) -> Result<Admission, AdmissionError> {
        let (respond_to, rx) = oneshot::channel();
        self.acquire_tx
            .send(AcquireCommand {
                torrent_id,
                respond_to,
            })
            .await
            .map_err(|_| AdmissionError::GateShutdown)?;

        rx.await.map_err(|_| AdmissionError::GateShutdown)
    }

    pub async fn update_limit(&self, limit: usize) -> Result<(), AdmissionError> {
        self.control_tx
            .send(ControlCommand::UpdateLimit { limit })
            .await
            .map_err(|_| AdmissionError::GateShutdown)
    }

    pub async fn holders(&self) -> Result<Vec<TorrentId>, AdmissionError> {
        let (respond_to, rx) = oneshot::channel();
        self.control_tx
            .send(ControlCommand::Holders { respond_to })
            .await
            .map_err(|_| AdmissionError::GateShutdown)?;
        rx.await.map_err(|_| AdmissionError::GateShutdown)
    }
}

#[derive(Debug)]
struct AcquireCommand {
    torrent_id: TorrentId,
    respond_to: oneshot::Sender<Admission>,
}

#[derive(Debug)]
enum ControlCommand {
    Release {
        torrent_id: TorrentId,
    },
    UpdateLimit {
        limit: usize,
    },
    Holders {
        respond_to: oneshot::Sender<Vec<TorrentId>>,
    },
}

pub struct AdmissionGate {
    acquire_rx: mpsc::Receiver<AcquireCommand>,
    control_rx: mpsc::Receiver<ControlCommand>,
    control_tx: mpsc::Sender<ControlCommand>,
    limit: usize,
    holders: Vec<TorrentId>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AdmissionGate {
    pub fn new(limit: usize, shutdown_tx: broadcast::Sender<()>) -> (Self, AdmissionClient) {
        let (acquire_tx, acquire_rx) = mpsc::channel(GATE_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(GATE_CHANNEL_CAPACITY);

        let client = AdmissionClient {
            acquire_tx,
            control_tx: control_tx.clone(),
        };
        let actor = Self {
            acquire_rx,
            control_rx,
            control_tx,
            limit,
            holders: Vec::new(),
            shutdown_tx,
        };
        (actor, client)
    }

    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(cmd) = self.acquire_rx.recv() => self.handle_acquire(cmd),
                Some(cmd) = self.control_rx.recv() => {
                    match cmd {
                        ControlCommand::Release { torrent_id } => self.handle_release(torrent_id),
                        ControlCommand::UpdateLimit { limit } => {
                            event!(Level::INFO, old = self.limit, new = limit, "Admission limit updated.");
                            self.limit = limit;
                        }
                        ControlCommand::Holders { respond_to } => {
                            let _ = respond_to.send(self.holders.clone());
                        }
                    }
                },
                else => break,
            }
        }
        event!(Level::DEBUG, "Admission gate shut down.");
    }

    fn handle_acquire(&mut self, cmd: AcquireCommand) {
        let AcquireCommand {
            torrent_id,
            respond_to,
        } = cmd;

        if self.holders.len() < self.limit {
            self.holders.push(torrent_id);
            event!(Level::DEBUG, torrent_id = %torrent_id, "Admission granted.");
            let permit = AdmissionPermit {
                torrent_id,
                control_tx: self.control_tx.clone(),
            };
            // If the requester went away the permit comes back to us and its
            // drop queues the matching release.
            let _ = respond_to.send(Admission::Granted(permit));
        } else {
            event!(Level::TRACE, torrent_id = %torrent_id, holders = ?self.holders, "Admission denied.");
            let _ = respond_to.send(Admission::Denied {
                holders: self.holders.clone(),
            });
        }
    }

    fn handle_release(&mut self, torrent_id: TorrentId) {
        if let Some(pos) = self.holders.iter().position(|&h| h == torrent_id) {
            self.holders.swap_remove(pos);
            event!(Level::DEBUG, torrent_id = %torrent_id, "Admission released.");
        } else {
            event!(Level::WARN, torrent_id = %torrent_id, "Release for a torrent that holds no admission.");
        }
    }
}
