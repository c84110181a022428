// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::AppError;
use crate::resume::NoResume;
use crate::storage::DiskStore;
use crate::torrent_file::{parser, Torrent};
use crate::torrent_manager::reconcile::{reconcile, TorrentGeometry};
use crate::torrent_manager::{PieceState, ProgressRecord, TorrentId};

use clap::{Parser, Subcommand};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Torrent files to start alongside the configured ones.
    pub inputs: Vec<PathBuf>,

    /// Download directory for torrents given on the command line.
    #[arg(long)]
    pub download_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Hash a torrent's data once and report what is present.
    Check {
        torrent: PathBuf,

        #[arg(long)]
        download_path: PathBuf,
    },
    /// Ask the running client to rehash a torrent.
    Recheck { info_hash: String },
    /// Tell the running client a torrent finished downloading.
    Complete { info_hash: String },
    /// Stop and forget a torrent in the running client.
    Remove { info_hash: String },
    /// Make the running client reread its settings file.
    Reload,
    /// Shut the running client down.
    StopClient,
}

fn normalize_info_hash(info_hash: &str) -> Result<String, AppError> {
    match hex::decode(info_hash.trim()) {
        Ok(bytes) if bytes.len() == 20 => Ok(hex::encode(bytes)),
        _ => Err(AppError::InvalidInfoHash(info_hash.to_string())),
    }
}

/// Name of the watch-folder file that carries `command` to a running
/// client, or `None` for commands that run locally.
pub fn control_file_name(command: &Commands) -> Result<Option<String>, AppError> {
    let name = match command {
        Commands::Check { .. } => return Ok(None),
        Commands::Recheck { info_hash } => format!("{}.check", normalize_info_hash(info_hash)?),
        Commands::Complete { info_hash } => {
            format!("{}.completed", normalize_info_hash(info_hash)?)
        }
        Commands::Remove { info_hash } => format!("{}.remove", normalize_info_hash(info_hash)?),
        Commands::Reload => "reload.cmd".to_string(),
        Commands::StopClient => "shutdown.cmd".to_string(),
    };
    Ok(Some(name))
}

/// Writes `content` under a `.tmp` name first so the watcher only ever
/// sees the complete file.
pub fn write_control_file(watch_path: &Path, file_name: &str, content: &[u8]) -> io::Result<PathBuf> {
    let final_path = watch_path.join(file_name);
    let temp_path = watch_path.join(format!("{}.tmp", file_name));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &final_path)?;
    tracing::info!("Wrote control file {:?}", final_path);
    Ok(final_path)
}

/// Hands a torrent file to an already running client as a `.path` file.
pub fn process_input(input: &Path, watch_path: &Path) -> io::Result<PathBuf> {
    let absolute_path = fs::canonicalize(input)?;
    let absolute = absolute_path.to_string_lossy();
    let file_hash_hex = hex::encode(Sha1::digest(absolute.as_bytes()));
    write_control_file(
        watch_path,
        &format!("{}.path", file_hash_hex),
        absolute.as_bytes(),
    )
}

pub async fn load_torrent_file(path: &Path) -> Result<Torrent, AppError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| AppError::ReadTorrent {
            path: path.to_path_buf(),
            source,
        })?;
    parser::from_bytes(&bytes).map_err(|source| AppError::ParseTorrent {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Serialize, Debug)]
pub struct CheckReport {
    pub name: String,
    pub info_hash: String,
    pub progress: ProgressRecord,
    pub missing_pieces: Vec<u32>,
}

/// Full rehash of one torrent against the data under `download_path`.
/// Missing files are created at their declared size, as on a normal start.
pub async fn run_check(torrent_path: &Path, download_path: &Path) -> Result<CheckReport, AppError> {
    let torrent = load_torrent_file(torrent_path).await?;
    let geometry = TorrentGeometry::from_torrent(&torrent)?;

    let torrent_id = TorrentId(0);
    let store = DiskStore::new();
    store.register(torrent_id, download_path, &torrent).await;

    let reconciled = reconcile(torrent_id, &geometry, &store, &NoResume).await?;
    let missing_pieces = reconciled
        .pieces
        .iter()
        .filter(|p| p.state == PieceState::NotFetched)
        .map(|p| p.index)
        .collect();

    tracing::info!(
        "Checked {:?}: {} of {} bytes present",
        torrent_path,
        reconciled.progress.downloaded,
        reconciled.progress.total
    );

    Ok(CheckReport {
        name: torrent.info.name.clone(),
        info_hash: hex::encode(torrent.info_hash()),
        progress: reconciled.progress,
        missing_pieces,
    })
}
