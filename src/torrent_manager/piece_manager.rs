// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_manager::{PieceEntry, PieceState, PieceTable, TorrentId};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{event, Level};

/// In-memory piece table shared by every controller.
///
/// Each torrent's rows are replaced as a whole by `add_pieces`, so a reader
/// sees either nothing or the full committed table.
#[derive(Default, Debug)]
pub struct PieceStateTable {
    pieces: RwLock<HashMap<TorrentId, Vec<PieceEntry>>>,
}

impl PieceStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove(&self, torrent_id: TorrentId) {
        self.pieces.write().await.remove(&torrent_id);
    }
}

#[async_trait]
impl PieceTable for PieceStateTable {
    async fn add_pieces(&self, torrent_id: TorrentId, mut pieces: Vec<PieceEntry>) {
        pieces.sort_by_key(|p| p.index);
        event!(Level::DEBUG, torrent_id = %torrent_id, count = pieces.len(), "Piece table committed.");
        self.pieces.write().await.insert(torrent_id, pieces);
    }

    async fn is_fetched(&self, torrent_id: TorrentId, index: u32) -> bool {
        self.pieces
            .read()
            .await
            .get(&torrent_id)
            .and_then(|pieces| {
                pieces
                    .binary_search_by_key(&index, |p| p.index)
                    .ok()
                    .map(|pos| &pieces[pos])
            })
            .is_some_and(|p| p.state == PieceState::Fetched)
    }

    async fn list_indices(&self, torrent_id: TorrentId) -> Vec<u32> {
        self.pieces
            .read()
            .await
            .get(&torrent_id)
            .map(|pieces| pieces.iter().map(|p| p.index).collect())
            .unwrap_or_default()
    }

    async fn fetched_indices(&self, torrent_id: TorrentId) -> Vec<u32> {
        self.pieces
            .read()
            .await
            .get(&torrent_id)
            .map(|pieces| {
                pieces
                    .iter()
                    .filter(|p| p.state == PieceState::Fetched)
                    .map(|p| p.index)
                    .collect()
            })
            .unwrap_or_default()
    }
}
