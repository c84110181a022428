// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod admission_gate;
mod app;
mod config;
mod errors;
mod integrations;
mod resume;
mod storage;
mod torrent_file;
mod torrent_manager;
mod tracker;

use app::App;

use fs2::FileExt;
use std::fs;
use std::fs::File;

use std::path::PathBuf;

use crate::config::load_settings;
use crate::integrations::cli::{Cli, Commands};

use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;

use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use clap::Parser;

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let base_data_dir = config::get_data_dir();
    let log_dir = base_data_dir.join("logs");

    let general_log = if fs::create_dir_all(&log_dir).is_ok() {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(31)
            .filename_prefix("seedgate")
            .filename_suffix("log")
            .build(&log_dir)
            .ok()
    } else {
        None
    };
    let _guard_general = match general_log {
        Some(general_log) => {
            let (non_blocking_general, guard) = tracing_appender::non_blocking(general_log);
            let quiet_filter = Targets::new().with_default(DEFAULT_LOG_FILTER);
            let general_layer = fmt::layer()
                .with_writer(non_blocking_general)
                .with_ansi(false)
                .with_filter(quiet_filter);
            let _ = tracing_subscriber::registry()
                .with(general_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().try_init();
            None
        }
    };

    tracing::info!("STARTING SEEDGATE");

    let cli = Cli::parse();

    config::create_watch_directories(&base_data_dir)?;
    let (watch_path, _) = config::watch_paths(&base_data_dir);

    if let Some(command) = &cli.command {
        if let Commands::Check {
            torrent,
            download_path,
        } = command
        {
            let report = integrations::cli::run_check(torrent, download_path).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if let Some(file_name) = integrations::cli::control_file_name(command)? {
            let content: &[u8] = match command {
                Commands::StopClient => b"STOP",
                _ => b"",
            };
            integrations::cli::write_control_file(&watch_path, &file_name, content)?;
            println!("Command queued for the running client.");
        }
        return Ok(());
    }

    let lock_path = base_data_dir.join("seedgate.lock");
    let lock_file = File::create(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        // Hand the inputs to the instance that holds the lock.
        for input in &cli.inputs {
            match integrations::cli::process_input(input, &watch_path) {
                Ok(_) => println!("Sent {:?} to the running client.", input),
                Err(e) => eprintln!("[Error] Could not forward {:?}: {}", input, e),
            }
        }
        println!("seedgate is already running.");
        return Ok(());
    }

    let mut settings = load_settings();
    if settings.client_id.is_empty() {
        settings.client_id = app::generate_client_id_string();
        if let Err(e) = config::save_settings(&settings) {
            tracing::error!("Failed to save settings after generating client ID: {}", e);
        }
    }

    let cli_download_dir = cli
        .download_path
        .clone()
        .or_else(|| settings.default_download_folder.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut app = App::new(settings, base_data_dir).await?;
    app.start_configured_torrents().await;
    for input in &cli.inputs {
        if let Err(e) = app.add_torrent_file(input, &cli_download_dir).await {
            tracing::error!("Failed to add {:?}: {}", input, e);
            eprintln!("[Error] {}", e);
        }
    }

    tracing::info!("{} torrent(s) loaded", app.torrent_ids().len());

    if let Err(e) = app.run().await {
        eprintln!("[Error] Application failed: {}", e);
    }

    drop(lock_file);
    Ok(())
}
