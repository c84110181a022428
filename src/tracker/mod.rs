// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-torrent tracker sessions.
//!
//! The announce protocol itself lives outside this crate; a session here
//! owns the lifecycle of one torrent's tracker link and records the
//! announce events it would send. A session is scoped to the broadcast
//! sender it was started under and ends when that sender is signalled or
//! dropped.

use crate::errors::TrackerError;
use crate::torrent_manager::{TorrentId, TrackerSupervisor};

use async_trait::async_trait;
use serde::Serialize;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{event, Level};

const TRACKER_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnounceRecord {
    pub torrent_id: TorrentId,
    pub url: String,
    pub event: AnnounceEvent,
}

#[derive(Debug)]
enum TrackerCommand {
    Completed,
}

/// Handle to a running tracker session.
#[derive(Debug, Clone)]
pub struct TrackerRef {
    torrent_id: TorrentId,
    url: String,
    command_tx: mpsc::Sender<TrackerCommand>,
}

impl TrackerRef {
    pub fn torrent_id(&self) -> TorrentId {
        self.torrent_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[cfg(test)]
    pub(crate) fn detached(torrent_id: TorrentId, url: &str) -> Self {
        let (command_tx, _) = mpsc::channel(1);
        Self {
            torrent_id,
            url: url.to_string(),
            command_tx,
        }
    }
}

fn check_tracker_url(url: &str) -> Result<(), TrackerError> {
    let supported = ["http://", "https://", "udp://"];
    match supported.iter().find_map(|scheme| url.strip_prefix(scheme)) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(TrackerError::UnsupportedUrl(url.to_string())),
    }
}

#[derive(Clone, Default)]
pub struct TrackerHub {
    announces: Arc<RwLock<Vec<AnnounceRecord>>>,
}

impl TrackerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces recorded for one torrent, oldest first.
    pub async fn announces_for(&self, torrent_id: TorrentId) -> Vec<AnnounceRecord> {
        self.announces
            .read()
            .await
            .iter()
            .filter(|r| r.torrent_id == torrent_id)
            .cloned()
            .collect()
    }
}

async fn record(
    announces: &RwLock<Vec<AnnounceRecord>>,
    torrent_id: TorrentId,
    url: &str,
    announce_event: AnnounceEvent,
) {
    event!(Level::INFO, torrent_id = %torrent_id, tracker = %url, event = ?announce_event, "Tracker announce.");
    announces.write().await.push(AnnounceRecord {
        torrent_id,
        url: url.to_string(),
        event: announce_event,
    });
}

async fn run_session(
    torrent_id: TorrentId,
    url: String,
    announces: Arc<RwLock<Vec<AnnounceRecord>>>,
    mut parent_rx: broadcast::Receiver<()>,
    mut command_rx: mpsc::Receiver<TrackerCommand>,
) {
    loop {
        tokio::select! {
            biased;
            _ = parent_rx.recv() => break,
            command = command_rx.recv() => match command {
                Some(TrackerCommand::Completed) => {
                    record(&announces, torrent_id, &url, AnnounceEvent::Completed).await;
                }
                None => break,
            },
        }
    }
    record(&announces, torrent_id, &url, AnnounceEvent::Stopped).await;
    event!(Level::DEBUG, torrent_id = %torrent_id, "Tracker session ended.");
}

#[async_trait]
impl TrackerSupervisor for TrackerHub {
    async fn start_tracker_for(
        &self,
        parent: &broadcast::Sender<()>,
        url: &str,
        info_hash: &[u8],
        peer_id: &str,
        torrent_id: TorrentId,
    ) -> Result<TrackerRef, TrackerError> {
        check_tracker_url(url)?;

        event!(
            Level::DEBUG,
            torrent_id = %torrent_id,
            info_hash = %hex::encode(info_hash),
            peer_id = %peer_id,
            "Starting tracker session."
        );

        let parent_rx = parent.subscribe();
        let (command_tx, command_rx) = mpsc::channel(TRACKER_CHANNEL_CAPACITY);

        record(&self.announces, torrent_id, url, AnnounceEvent::Started).await;
        tokio::spawn(run_session(
            torrent_id,
            url.to_string(),
            self.announces.clone(),
            parent_rx,
            command_rx,
        ));

        Ok(TrackerRef {
            torrent_id,
            url: url.to_string(),
            command_tx,
        })
    }

    async fn notify_completed(&self, tracker: &TrackerRef) -> Result<(), TrackerError> {
        tracker
            .command_tx
            .send(TrackerCommand::Completed)
            .await
            .map_err(|_| TrackerError::TrackerGone(tracker.torrent_id))
    }
}
