// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_manager::{LifecycleEvent, LifecycleSink, TorrentId};

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleNotice {
    pub torrent_id: TorrentId,
    pub event: LifecycleEvent,
}

/// Fans lifecycle events out to whoever is listening. With no listeners the
/// event is only logged.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleNotice>,
}

impl LifecycleBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.tx.subscribe()
    }
}

impl LifecycleSink for LifecycleBus {
    fn notify(&self, torrent_id: TorrentId, event: LifecycleEvent) {
        tracing::info!(%torrent_id, ?event, "Lifecycle event.");
        let _ = self.tx.send(LifecycleNotice { torrent_id, event });
    }
}
