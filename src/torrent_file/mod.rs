// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod parser;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub const HASH_LENGTH: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Torrent {
    // Not part of the bencode source; filled in by the parser so the
    // info hash can be computed over the exact original bytes.
    #[serde(skip)]
    pub info_dict_bencode: Vec<u8>,

    pub info: Info,
    pub announce: Option<String>,

    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,

    #[serde(rename = "creation date", default)]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(rename = "created by", default)]
    pub created_by: Option<String>,
}

impl Torrent {
    pub fn info_hash(&self) -> Vec<u8> {
        Sha1::digest(&self.info_dict_bencode).to_vec()
    }

    pub fn declared_length(&self) -> u64 {
        self.info.total_length().max(0) as u64
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length.max(0) as u64
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len() / HASH_LENGTH
    }

    pub fn piece_hashes(&self) -> Vec<[u8; HASH_LENGTH]> {
        self.info
            .pieces
            .chunks_exact(HASH_LENGTH)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LENGTH];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// The primary announce URL, falling back to the first tier of the
    /// announce list.
    pub fn tracker_url(&self) -> Option<String> {
        if let Some(ref announce) = self.announce {
            if !announce.is_empty() {
                return Some(announce.clone());
            }
        }
        self.announce_list
            .as_ref()
            .and_then(|tiers| tiers.iter().flatten().next().cloned())
    }

    /// Rejects metadata whose piece geometry cannot be reconciled.
    pub fn check_geometry(&self) -> Result<(), String> {
        if self.info.piece_length <= 0 {
            return Err(format!("invalid piece length {}", self.info.piece_length));
        }
        if self.info.pieces.len() % HASH_LENGTH != 0 {
            return Err(format!(
                "pieces field is {} bytes, not a multiple of {}",
                self.info.pieces.len(),
                HASH_LENGTH
            ));
        }
        if self.num_pieces() == 0 {
            return Err("torrent has no pieces".to_string());
        }
        Ok(())
    }

    pub fn file_list(&self) -> Vec<(Vec<String>, u64)> {
        if !self.info.files.is_empty() {
            self.info
                .files
                .iter()
                .map(|f| (f.path.clone(), f.length as u64))
                .collect()
        } else {
            vec![(vec![self.info.name.clone()], self.info.length as u64)]
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Info {
    #[serde(rename = "piece length")]
    pub piece_length: i64,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub pieces: Vec<u8>,

    #[serde(default)]
    pub private: Option<i64>,

    #[serde(default)]
    pub files: Vec<InfoFile>,

    pub name: String,

    #[serde(default)]
    pub length: i64,
}

impl Info {
    pub fn total_length(&self) -> i64 {
        if self.length > 0 {
            return self.length;
        }
        self.files.iter().map(|f| f.length).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InfoFile {
    pub length: i64,

    pub path: Vec<String>,
}
