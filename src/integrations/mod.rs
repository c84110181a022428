// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod cli;
pub mod lifecycle;
pub mod status;
pub mod watcher;
