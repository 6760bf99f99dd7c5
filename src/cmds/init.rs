// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the job database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_path))]
    db: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut conn = super::open_conn(&args.db, super::OpenMode::Create)?;

    // Check if the database has already been initialized.
    if let Some(v) = db::get_schema_version(&conn)? {
        info!("Database is already initialized with schema version {v}.");
        return Ok(0);
    }

    // Use WAL mode, which is the most efficient way to preserve database
    // integrity with a reader (the API) and writers (workers) in separate
    // processes.
    conn.execute_batch("pragma journal_mode = wal;")
        .map_err(|e| base::Error::wrap(base::ErrorKind::DbFailure, "unable to set wal mode", e))?;
    db::init(&mut conn)?;
    info!("Database initialized.");
    Ok(0)
}
