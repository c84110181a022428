// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::app::AppCommand;
use notify::{Config, Error as NotifyError, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{event as tracing_event, Level};

pub fn create_watcher(
    watch_path: &Path,
    tx: mpsc::Sender<Result<Event, NotifyError>>,
) -> Result<RecommendedWatcher, NotifyError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, NotifyError>| {
            if let Err(e) = tx.blocking_send(res) {
                tracing_event!(Level::ERROR, "Failed to send file event: {}", e);
            }
        },
        Config::default(),
    )?;

    watcher.watch(watch_path, RecursiveMode::NonRecursive)?;
    tracing_event!(Level::INFO, "Watching command path: {:?}", watch_path);
    Ok(watcher)
}

/// Commands already waiting in the folder, e.g. written while no client ran.
pub fn scan_watch_folder(watch_path: &Path) -> Vec<AppCommand> {
    let entries = match fs::read_dir(watch_path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing_event!(
                Level::WARN,
                "Failed to read watch directory {:?}: {}",
                watch_path,
                e
            );
            return Vec::new();
        }
    };

    let mut paths: Vec<_> = entries.flatten().map(|entry| entry.path()).collect();
    paths.sort();
    paths.iter().filter_map(|p| path_to_command(p)).collect()
}

pub fn path_to_command(path: &Path) -> Option<AppCommand> {
    if !path.is_file() {
        return None;
    }

    let file_name = path.file_name().and_then(|n| n.to_str())?;
    if file_name.starts_with('.') || file_name.ends_with(".tmp") {
        return None;
    }

    let ext = path.extension().and_then(|s| s.to_str())?;
    match ext {
        "torrent" => Some(AppCommand::AddTorrentFromFile(path.to_path_buf())),
        "path" => Some(AppCommand::AddTorrentFromPathFile(path.to_path_buf())),
        "check" => Some(AppCommand::RequestCheck(path.to_path_buf())),
        "completed" => Some(AppCommand::NotifyCompleted(path.to_path_buf())),
        "remove" => Some(AppCommand::RemoveTorrent(path.to_path_buf())),
        "cmd" => match file_name {
            "shutdown.cmd" => Some(AppCommand::ClientShutdown(path.to_path_buf())),
            "reload.cmd" => Some(AppCommand::ReloadSettings(path.to_path_buf())),
            _ => None,
        },
        _ => None,
    }
}

/// Info hash named by a `<hex>.check`-style command file.
pub fn info_hash_from_command_file(path: &Path) -> Option<Vec<u8>> {
    let stem = path.file_stem().and_then(|s| s.to_str())?;
    hex::decode(stem).ok().filter(|bytes| bytes.len() == 20)
}
