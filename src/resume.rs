// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fast-resume snapshots.
//!
//! A snapshot records what a previous session knew about a torrent's pieces
//! so the next start can skip the full disk rehash. Snapshots live in a
//! single TOML file keyed by the hex-encoded info hash.

use crate::errors::ResumeError;
use crate::torrent_manager::TorrentId;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{event, Level};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeStatus {
    #[default]
    Unknown,
    Seeding,
    Bitfield(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumeSnapshot {
    pub status: ResumeStatus,
    pub all_time_uploaded: u64,
    pub all_time_downloaded: u64,
}

#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn query_state(&self, torrent_id: TorrentId) -> Result<ResumeSnapshot, ResumeError>;
}

/// Resume store for one-shot runs: every torrent is a first run.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResume;

#[async_trait]
impl ResumeStore for NoResume {
    async fn query_state(&self, _torrent_id: TorrentId) -> Result<ResumeSnapshot, ResumeError> {
        Ok(ResumeSnapshot::default())
    }
}

/// Decodes an MSB-first bitfield into one flag per piece.
///
/// The byte length must be exactly `ceil(piece_count / 8)` and the spare
/// bits of the last byte must be clear.
pub fn decode_bitfield(bytes: &[u8], piece_count: usize) -> Result<Vec<bool>, ResumeError> {
    let expected = piece_count.div_ceil(8);
    if bytes.len() != expected {
        return Err(ResumeError::BitfieldLength {
            expected,
            actual: bytes.len(),
            piece_count,
        });
    }

    let spare_bits = expected * 8 - piece_count;
    if spare_bits > 0 {
        let mask = (1u8 << spare_bits) - 1;
        if bytes[expected - 1] & mask != 0 {
            return Err(ResumeError::BitfieldSpareBits { piece_count });
        }
    }

    Ok((0..piece_count)
        .map(|i| bytes[i / 8] & (1 << (7 - (i % 8))) != 0)
        .collect())
}

pub fn encode_bitfield(fetched: &[bool]) -> Vec<u8> {
    let mut bitfield = vec![0u8; fetched.len().div_ceil(8)];
    for (index, &is_set) in fetched.iter().enumerate() {
        if is_set {
            bitfield[index / 8] |= 1 << (7 - (index % 8));
        }
    }
    bitfield
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
enum StoredStatus {
    #[default]
    Unknown,
    Seeding,
    Bitfield,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
struct StoredEntry {
    status: StoredStatus,
    bitfield: String,
    all_time_uploaded: u64,
    all_time_downloaded: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct ResumeFile {
    torrents: BTreeMap<String, StoredEntry>,
}

impl StoredEntry {
    fn from_snapshot(snapshot: &ResumeSnapshot) -> Self {
        let (status, bitfield) = match &snapshot.status {
            ResumeStatus::Unknown => (StoredStatus::Unknown, String::new()),
            ResumeStatus::Seeding => (StoredStatus::Seeding, String::new()),
            ResumeStatus::Bitfield(bytes) => (StoredStatus::Bitfield, hex::encode(bytes)),
        };
        Self {
            status,
            bitfield,
            all_time_uploaded: snapshot.all_time_uploaded,
            all_time_downloaded: snapshot.all_time_downloaded,
        }
    }

    fn to_snapshot(&self) -> Result<ResumeSnapshot, ResumeError> {
        let status = match self.status {
            StoredStatus::Unknown => ResumeStatus::Unknown,
            StoredStatus::Seeding => ResumeStatus::Seeding,
            StoredStatus::Bitfield => ResumeStatus::Bitfield(hex::decode(&self.bitfield)?),
        };
        Ok(ResumeSnapshot {
            status,
            all_time_uploaded: self.all_time_uploaded,
            all_time_downloaded: self.all_time_downloaded,
        })
    }
}

/// TOML-backed [`ResumeStore`]. Torrent ids only live for one process, so
/// each id is bound to its info hash before the controller asks about it.
pub struct FileResumeStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, StoredEntry>>,
    bindings: RwLock<HashMap<TorrentId, String>>,
}

impl FileResumeStore {
    pub async fn load(path: &Path) -> Result<Self, ResumeError> {
        let entries = if fs::try_exists(path).await? {
            let content = fs::read_to_string(path).await?;
            let file: ResumeFile = toml::from_str(&content)?;
            event!(Level::DEBUG, path = %path.display(), count = file.torrents.len(), "Loaded fast-resume file.");
            file.torrents
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
            bindings: RwLock::new(HashMap::new()),
        })
    }

    pub async fn bind(&self, torrent_id: TorrentId, info_hash: &[u8]) {
        self.bindings
            .write()
            .await
            .insert(torrent_id, hex::encode(info_hash));
    }

    pub async fn record(&self, info_hash: &[u8], snapshot: &ResumeSnapshot) {
        self.entries
            .write()
            .await
            .insert(hex::encode(info_hash), StoredEntry::from_snapshot(snapshot));
    }

    /// Writes every recorded snapshot via a temp file and rename.
    pub async fn save(&self) -> Result<(), ResumeError> {
        let file = ResumeFile {
            torrents: self.entries.read().await.clone(),
        };
        let content = toml::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("toml.tmp");
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn query_state(&self, torrent_id: TorrentId) -> Result<ResumeSnapshot, ResumeError> {
        let key = match self.bindings.read().await.get(&torrent_id) {
            Some(key) => key.clone(),
            None => return Ok(ResumeSnapshot::default()),
        };
        match self.entries.read().await.get(&key) {
            Some(entry) => entry.to_snapshot(),
            None => Ok(ResumeSnapshot::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_decode_bitfield_msb_first() {
        let flags = decode_bitfield(&[0b1010_1000], 5).unwrap();
        assert_eq!(flags, vec![true, false, true, false, true]);
    }

    #[test]
    fn test_encode_bitfield_matches_decode() {
        let fetched = vec![true, false, true, false, true];
        let bitfield = encode_bitfield(&fetched);
        assert_eq!(bitfield, vec![0b1010_1000]);

        let nine = vec![false, false, false, false, false, false, false, true, true];
        assert_eq!(encode_bitfield(&nine), vec![0b0000_0001, 0b1000_0000]);
        assert_eq!(decode_bitfield(&encode_bitfield(&nine), 9).unwrap(), nine);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        match decode_bitfield(&[0xFF, 0x00], 5) {
            Err(ResumeError::BitfieldLength {
                expected: 1,
                actual: 2,
                piece_count: 5,
            }) => {}
            other => panic!("Expected BitfieldLength, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_spare_bits() {
        // Piece count 5 leaves the low three bits unused.
        assert!(matches!(
            decode_bitfield(&[0b1010_1001], 5),
            Err(ResumeError::BitfieldSpareBits { piece_count: 5 })
        ));
        // A full byte has no spare bits to check.
        assert_eq!(decode_bitfield(&[0xFF], 8).unwrap(), vec![true; 8]);
    }

    #[tokio::test]
    async fn test_missing_file_yields_unknown() {
        let dir = tempdir().unwrap();
        let store = FileResumeStore::load(&dir.path().join("fast_resume.toml"))
            .await
            .unwrap();
        store.bind(TorrentId(1), &[0xAA; 20]).await;

        let snapshot = store.query_state(TorrentId(1)).await.unwrap();
        assert_eq!(snapshot, ResumeSnapshot::default());

        // Unbound ids also count as first run.
        let unbound = store.query_state(TorrentId(2)).await.unwrap();
        assert_eq!(unbound.status, ResumeStatus::Unknown);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fast_resume.toml");
        let seeding_hash = [0x01; 20];
        let partial_hash = [0x02; 20];

        let store = FileResumeStore::load(&path).await.unwrap();
        store
            .record(
                &seeding_hash,
                &ResumeSnapshot {
                    status: ResumeStatus::Seeding,
                    all_time_uploaded: 500,
                    all_time_downloaded: 1000,
                },
            )
            .await;
        store
            .record(
                &partial_hash,
                &ResumeSnapshot {
                    status: ResumeStatus::Bitfield(vec![0b1010_1000]),
                    all_time_uploaded: 0,
                    all_time_downloaded: 30,
                },
            )
            .await;
        store.save().await.unwrap();
        assert!(!path.with_extension("toml.tmp").exists());

        let reloaded = FileResumeStore::load(&path).await.unwrap();
        reloaded.bind(TorrentId(10), &seeding_hash).await;
        reloaded.bind(TorrentId(11), &partial_hash).await;

        let seeding = reloaded.query_state(TorrentId(10)).await.unwrap();
        assert_eq!(seeding.status, ResumeStatus::Seeding);
        assert_eq!(seeding.all_time_uploaded, 500);
        assert_eq!(seeding.all_time_downloaded, 1000);

        let partial = reloaded.query_state(TorrentId(11)).await.unwrap();
        assert_eq!(partial.status, ResumeStatus::Bitfield(vec![0b1010_1000]));
        assert_eq!(partial.all_time_downloaded, 30);
    }

    #[tokio::test]
    async fn test_corrupt_hex_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fast_resume.toml");
        let key = hex::encode([0x03; 20]);
        let content = format!(
            "[torrents.{}]\nstatus = \"Bitfield\"\nbitfield = \"zz\"\n",
            key
        );
        tokio::fs::write(&path, content).await.unwrap();

        let store = FileResumeStore::load(&path).await.unwrap();
        store.bind(TorrentId(1), &[0x03; 20]).await;
        assert!(matches!(
            store.query_state(TorrentId(1)).await,
            Err(ResumeError::Hex(_))
        ));
    }

    #[tokio::test]
    async fn test_unparseable_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fast_resume.toml");
        tokio::fs::write(&path, "torrents = 12").await.unwrap();

        assert!(matches!(
            FileResumeStore::load(&path).await,
            Err(ResumeError::Parse(_))
        ));
    }
}
