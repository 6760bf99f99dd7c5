// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::{err, Error, ErrorKind};
use std::path::Path;
use tracing::info;

pub mod init;
pub mod run;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OpenMode {
    ReadWrite,
    Create,
}

/// Opens the SQLite database file.
fn open_conn(db_path: &Path, mode: OpenMode) -> Result<rusqlite::Connection, Error> {
    info!(
        "Opening {} in {:?} mode with SQLite version {}",
        db_path.display(),
        mode,
        rusqlite::version()
    );
    if mode == OpenMode::Create {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                err!(
                    ConfigError,
                    msg("unable to create db dir {}", parent.display()),
                    source(e)
                )
            })?;
        }
    }
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        match mode {
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } |
        // rusqlite::Connection is not Sync, so there's no reason to tell
        // SQLite3 to use the serialized threading mode.
        rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| {
        err!(
            DbFailure,
            msg(
                "unable to open {}; try running `reelcut init` first",
                db_path.display()
            ),
            source(e)
        )
    })?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| Error::wrap(ErrorKind::DbFailure, "unable to set busy timeout", e))?;
    Ok(conn)
}
