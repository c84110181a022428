// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::Settings;
use crate::torrent_manager::{ProgressRecord, ProgressSink, TorrentId, TorrentStatus};
use crate::tracker::AnnounceRecord;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Latest progress record per torrent.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    records: RwLock<HashMap<TorrentId, ProgressRecord>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, torrent_id: TorrentId) -> Option<ProgressRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&torrent_id)
            .copied()
    }
}

impl ProgressSink for ProgressBoard {
    fn publish(&self, torrent_id: TorrentId, record: ProgressRecord) {
        tracing::debug!(%torrent_id, left = record.left, "Progress published.");
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(torrent_id, record);
    }
}

#[derive(Serialize, Debug)]
pub struct TorrentOutputState {
    pub torrent_id: TorrentId,
    pub name: String,
    pub status: TorrentStatus,
    pub progress: Option<ProgressRecord>,
    pub announces: Vec<AnnounceRecord>,
    /// Why the controller stopped, if it ended with an error.
    pub error: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct AppOutputState {
    pub run_time: u64,
    #[serde(serialize_with = "serialize_torrents_hex")]
    pub torrents: BTreeMap<Vec<u8>, TorrentOutputState>,
    /// Torrents holding an admission permit right now.
    pub verifying: Vec<TorrentId>,
    pub settings: Settings,
}

pub fn serialize_torrents_hex<S>(
    map: &BTreeMap<Vec<u8>, TorrentOutputState>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map_ser = s.serialize_map(Some(map.len()))?;
    for (k, v) in map {
        map_ser.serialize_entry(&hex::encode(k), v)?;
    }
    map_ser.end()
}

pub fn status_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("status_files").join("app_state.json")
}

pub async fn dump(output_data: AppOutputState, file_path: PathBuf) -> std::io::Result<()> {
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&output_data).map_err(std::io::Error::other)?;
        std::fs::write(file_path, json)
    })
    .await
    .map_err(std::io::Error::other)?;

    if let Err(ref e) = result {
        tracing::error!("Failed to write status dump: {:?}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_board_keeps_latest_record() {
        let board = ProgressBoard::new();
        assert!(board.get(TorrentId(1)).is_none());

        board.publish(
            TorrentId(1),
            ProgressRecord {
                downloaded: 10,
                left: 15,
                total: 25,
                ..Default::default()
            },
        );
        board.publish(
            TorrentId(1),
            ProgressRecord {
                downloaded: 25,
                left: 0,
                total: 25,
                ..Default::default()
            },
        );

        assert_eq!(board.get(TorrentId(1)).unwrap().left, 0);
        assert!(board.get(TorrentId(2)).is_none());
    }

    #[tokio::test]
    async fn test_dump_writes_hex_keyed_json() {
        let dir = tempdir().unwrap();
        let path = status_file_path(dir.path());

        let mut torrents = BTreeMap::new();
        torrents.insert(
            vec![0xAB, 0xCD],
            TorrentOutputState {
                torrent_id: TorrentId(4),
                name: "data.bin".to_string(),
                status: TorrentStatus::Started,
                progress: Some(ProgressRecord {
                    downloaded: 20,
                    left: 5,
                    total: 25,
                    ..Default::default()
                }),
                announces: Vec::new(),
                error: Some("Tracker error".to_string()),
            },
        );
        let output = AppOutputState {
            run_time: 3,
            torrents,
            verifying: vec![TorrentId(4)],
            settings: Settings::default(),
        };

        dump(output, path.clone()).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["run_time"], 3);
        assert_eq!(json["torrents"]["abcd"]["status"], "Started");
        assert_eq!(json["torrents"]["abcd"]["progress"]["left"], 5);
        assert_eq!(json["torrents"]["abcd"]["torrent_id"], 4);
        assert_eq!(json["torrents"]["abcd"]["error"], "Tracker error");
        assert_eq!(json["verifying"][0], 4);
        assert_eq!(json["settings"]["admission_permits"], 1);
    }
}
