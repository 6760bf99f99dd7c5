// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand to run the clip-production worker.

use std::path::PathBuf;
use std::sync::Arc;

use base::clock::RealClocks;
use base::{shutdown, Error};
use bpaf::Bpaf;
use db::Database;
use tracing::info;

use crate::config::Config;
use crate::ffmpeg::Toolchain;
use crate::reframe::{CommandDetector, SubjectDetector};
use crate::render::FfmpegEncoder;
use crate::runner::{poll_loop, Runner};
use crate::storage::LocalStore;
use crate::transcribe::WhisperCli;

const DEFAULT_STORAGE_ROOT: &str = "/var/lib/reelcut/storage";

/// Runs the clip-production worker until killed.
///
/// A killed worker leaves its claimed row behind; another worker's stale
/// reclaim puts it back in the queue.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_path))]
    db: PathBuf,

    /// Root directory of the local artifact store.
    #[bpaf(argument("PATH"), fallback(DEFAULT_STORAGE_ROOT.into()), debug_fallback)]
    storage_root: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = Config::from_env()?;
    let clocks = RealClocks::default();

    let conn = super::open_conn(&args.db, super::OpenMode::ReadWrite)?;
    let db = Arc::new(Database::from_conn(conn, clocks)?);
    let storage = Arc::new(LocalStore::new(&args.storage_root)?);

    let tc = Toolchain::locate()?;
    info!(
        ffmpeg = %tc.ffmpeg.display(),
        ffprobe = %tc.ffprobe.display(),
        "media toolchain ready"
    );
    let transcriber = Arc::new(WhisperCli::locate(&cfg.whisper_bin, &cfg.whisper_model)?);
    let detector: Option<Arc<dyn SubjectDetector>> = match &cfg.detector_cmd {
        Some(program) => {
            info!(detector = %program.display(), "subject detector enabled");
            Some(Arc::new(CommandDetector::new(
                program.clone(),
                cfg.ffmpeg_timeout,
            )))
        }
        None => {
            info!("no subject detector configured; using centered framing");
            None
        }
    };
    let encoder = Arc::new(FfmpegEncoder::new(tc, cfg.ffmpeg_timeout));

    let runner = Runner {
        db,
        storage,
        encoder,
        transcriber,
        detector,
        title_hook: None,
        cfg,
    };

    // The sender lives for the whole process; the loop stops only when the
    // process is killed and the job row is recovered by stale reclaim.
    let (_shutdown_tx, shutdown_rx) = shutdown::channel();
    poll_loop(&runner, &shutdown_rx);
    Ok(0)
}
