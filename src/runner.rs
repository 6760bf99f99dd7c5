// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The job runner: claims work, drives the pipeline end to end, and owns the
//! billing contract.
//!
//! Stages run strictly in sequence; the only concurrency is one heartbeat
//! thread paired 1:1 with the active job. Every stage failure is caught at a
//! single site, recorded on the job row, and refunds any charge. Scratch
//! files live in a per-job temp dir that is removed on all exit paths.

use std::io::Read as _;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base::clock::{Clocks, TimerGuard};
use base::{bail, err, shutdown, Error, ErrorKind, ResultExt as _};
use db::{Database, JobRow, JobStatus, NewClip, Stage, UploadRow};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::captions::{self, CaptionPacing, CaptionStyle};
use crate::config::Config;
use crate::reframe::{self, CameraPath, SubjectDetector};
use crate::render::{Encoder, RenderRequest};
use crate::score::{self, ScoredPlan};
use crate::segment::{self, PlanLimits};
use crate::storage::ArtifactStore;
use crate::title::{self, TitleHook};
use crate::transcribe::Transcriber;

/// How often the poll loop runs stale reclaim.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// Job rows store at most this much error text.
const MAX_ERROR_CHARS: usize = 2000;

pub struct Runner<C: Clocks> {
    pub db: Arc<Database<C>>,
    pub storage: Arc<dyn ArtifactStore>,
    pub encoder: Arc<dyn Encoder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub detector: Option<Arc<dyn SubjectDetector>>,
    pub title_hook: Option<Arc<dyn TitleHook>>,
    pub cfg: Config,
}

impl<C: Clocks> Runner<C> {
    /// Runs one claimed job to a terminal status. Never panics the worker:
    /// all failures land on the job row.
    pub fn run_job(&self, job_id: i64) {
        let started = self.db.clocks().monotonic();
        info!(job_id, "claimed job");

        let (job, upload) = match self.db.job_with_upload(job_id) {
            Ok(v) => v,
            Err(e) => {
                self.finish_failed(job_id, &e, None);
                return;
            }
        };

        let hb = spawn_heartbeat(self.db.clone(), job_id, self.cfg.heartbeat_interval);
        let mut charged: Option<(i64, i64)> = None;
        let result = self.execute(&job, &upload, &mut charged);
        drop(hb);

        match result {
            Ok(clips) => {
                if let Err(e) = self.db.set_status(job_id, &JobStatus::Done, None) {
                    error!(job_id, err = %e.chain(), "unable to mark job done");
                    return;
                }
                let elapsed = self.db.clocks().monotonic().saturating_sub(started);
                info!(job_id, clips, ?elapsed, "finished job");
            }
            Err(e) => self.finish_failed(job_id, &e, charged),
        }
    }

    /// Terminal failure path: best-effort refund, then record the error.
    fn finish_failed(&self, job_id: i64, e: &Error, charged: Option<(i64, i64)>) {
        error!(job_id, err = %e.chain(), "job failed");
        let mut msg = e.to_string();
        if let Some((user_id, amount)) = charged {
            if let Err(re) = self.db.refund_credits(user_id, amount) {
                error!(job_id, user_id, err = %re.chain(), "credit refund failed");
                msg = format!("{msg}; refund of {amount} credit(s) failed: {re}");
            }
        }
        let msg = truncate_error(&msg);
        if let Err(se) = self.db.set_status(job_id, &JobStatus::Failed, Some(&msg)) {
            error!(job_id, err = %se.chain(), "unable to mark job failed");
        }
    }

    fn stage(&self, job_id: i64, stage: Stage) -> Result<(), Error> {
        info!(job_id, stage = %stage, "entering stage");
        self.db
            .set_status(job_id, &JobStatus::Running(Some(stage)), None)?;
        Ok(())
    }

    fn execute(
        &self,
        job: &JobRow,
        upload: &UploadRow,
        charged: &mut Option<(i64, i64)>,
    ) -> Result<usize, Error> {
        let clocks = self.db.clocks();
        let scratch = tempfile::Builder::new()
            .prefix(&format!("reelcut-job-{}-", job.id))
            .tempdir_in(&self.cfg.tmp_dir)
            .map_err(|e| err!(Internal, msg("unable to create scratch dir"), source(e)))?;

        // download
        self.stage(job.id, Stage::Download)?;
        let source_path = scratch.path().join("source.mp4");
        {
            let mut reader = self.storage.open(&upload.storage_key)?;
            let mut file = std::fs::File::create(&source_path)
                .map_err(|e| err!(Internal, msg("unable to create scratch file"), source(e)))?;
            let copied = std::io::copy(&mut (&mut reader).take(self.cfg.max_source_bytes + 1), &mut file)
                .err_kind(ErrorKind::StorageUnavailable)?;
            if copied > self.cfg.max_source_bytes {
                bail!(
                    CorruptMedia,
                    msg("source exceeds size limit ({} bytes)", self.cfg.max_source_bytes)
                );
            }
            if copied == 0 {
                bail!(CorruptMedia, msg("source blob is empty"));
            }
        }

        // preflight
        self.stage(job.id, Stage::Preflight)?;
        let info = self.encoder.probe(&source_path)?;
        let src_dims = info.display_dims();
        let out_dims = job.settings.aspect.dimensions();

        // billing
        self.stage(job.id, Stage::Billing)?;
        let user = self.db.user(upload.user_id)?;
        let required = required_credits(
            info.duration,
            self.cfg.credits_per_minute,
            self.cfg.min_credits_per_job,
        );
        self.db.charge_credits(user.id, required)?;
        *charged = Some((user.id, required));
        // Free-plan users always get the watermark, whatever the job asked.
        let watermark_on = job.settings.watermark_enabled || user.is_free_plan();

        // audio
        self.stage(job.id, Stage::Audio)?;
        let wav_path = scratch.path().join("audio.wav");
        self.encoder.extract_audio(&source_path, &wav_path)?;
        let samples = crate::audio::read_samples(&wav_path)?;
        let analysis = crate::audio::analyze(
            &samples,
            crate::audio::SAMPLE_RATE,
            self.cfg.silence_db,
            self.cfg.silence_min_dur,
        );

        // transcribe
        self.stage(job.id, Stage::Transcribe)?;
        let transcript = self.transcriber.transcribe(&wav_path)?;
        let words = transcript.words();

        // segment
        self.stage(job.id, Stage::Segment)?;
        let limits = PlanLimits {
            min: self.cfg.clip_min_seconds,
            target: self.cfg.clip_target_seconds,
            max: self.cfg.clip_max_seconds,
            max_gap_merge: self.cfg.max_gap_merge,
        };
        let utterances = segment::build_utterances(&words);
        let plans = segment::build_plans(&utterances, &analysis.silences, info.duration, &limits);
        info!(job_id = job.id, plans = plans.len(), "built clip plans");

        // reframe
        self.stage(job.id, Stage::Reframe)?;
        let detector = self.detector.as_deref();
        let cameras: Vec<CameraPath> = plans
            .iter()
            .map(|p| {
                reframe::plan_camera(detector, &source_path, p, src_dims, out_dims, &self.cfg.reframe)
            })
            .collect::<Result<_, _>>()?;

        // score
        self.stage(job.id, Stage::Score)?;
        let scored: Vec<ScoredPlan> = plans
            .iter()
            .zip(&cameras)
            .map(|(p, cam)| ScoredPlan {
                plan: *p,
                quality: score::score_plan(
                    p,
                    &words,
                    &analysis.silences,
                    analysis.energy_score,
                    cam.motion_score,
                    self.cfg.clip_target_seconds,
                ),
            })
            .collect();
        let selected = score::select_top(scored, self.cfg.top_k_clips);

        // render
        self.stage(job.id, Stage::Render)?;
        let style = self.caption_style(job);
        let pacing = CaptionPacing::from_opts(&self.cfg.caption);
        let mut rows = Vec::with_capacity(selected.len());
        for (index, sel) in selected.iter().enumerate() {
            let plan = &sel.plan;
            let camera = &cameras[plans
                .iter()
                .position(|p| p == plan)
                .expect("selected plan came from plans")];

            let ass_path = scratch.path().join(format!("clip-{index:02}.ass"));
            let mut subtitles = None;
            if job.settings.captions_enabled {
                let blocks = captions::build_blocks(&words, plan.start, plan.end, &pacing);
                if !blocks.is_empty() {
                    let subject_y = camera.median_cy() / src_dims.1 as f64;
                    captions::write_ass(&ass_path, &blocks, &style, out_dims, &pacing, Some(subject_y))?;
                    subtitles = Some(ass_path.as_path());
                }
            }

            let clip_path = scratch.path().join(format!("clip-{index:02}.mp4"));
            info!(
                job_id = job.id,
                index,
                start = plan.start,
                end = plan.end,
                "rendering clip"
            );
            {
                let _t = TimerGuard::new(clocks, || format!("rendering clip {index}"));
                self.encoder.render(&RenderRequest {
                    source: &source_path,
                    output: &clip_path,
                    plan,
                    camera,
                    src_dims,
                    out_dims,
                    subtitles,
                    watermark: watermark_on.then_some(&self.cfg.watermark),
                    opts: &self.cfg.render,
                })?;
            }

            let key = clip_key(upload.user_id, job.id, index);
            self.storage.save_file(&clip_path, &key)?;

            let opening = title::opening_text(&words, plan.start, plan.end);
            let title = self
                .title_hook
                .as_ref()
                .and_then(|h| h.suggest(&opening))
                .or_else(|| title::heuristic_title(&opening));
            rows.push(NewClip {
                storage_key: key,
                start_time: plan.start,
                end_time: plan.end,
                title,
            });
        }

        // persist (idempotent: prior rows for this job are replaced)
        let inserted = self.db.replace_clips(job.id, upload.id, &rows)?;
        Ok(inserted)
    }

    /// Resolves caption styling from worker defaults plus the job's style
    /// document. A malformed document logs and falls back to defaults.
    fn caption_style(&self, job: &JobRow) -> CaptionStyle {
        let defaults = CaptionStyle::from_opts(&self.cfg.caption);
        match &job.settings.caption_style {
            None => defaults,
            Some(doc) => match defaults.clone().with_overrides(doc) {
                Ok(s) => s,
                Err(e) => {
                    warn!(job_id = job.id, err = %e.chain(), "ignoring caption style document");
                    defaults
                }
            },
        }
    }
}

/// `max(min_credits, ceil(minutes) * rate)`.
pub fn required_credits(duration_seconds: f64, per_minute: i64, minimum: i64) -> i64 {
    let minutes = (duration_seconds / 60.0).ceil().max(1.0) as i64;
    (minutes * per_minute).max(minimum)
}

fn clip_key(user_id: i64, job_id: i64, index: usize) -> String {
    let uid = Uuid::new_v4().simple().to_string();
    format!("users/{user_id}/clips/{job_id}/{index:02}_{}.mp4", &uid[..10])
}

fn truncate_error(s: &str) -> String {
    if s.chars().count() <= MAX_ERROR_CHARS {
        return s.to_owned();
    }
    s.chars().take(MAX_ERROR_CHARS).collect()
}

struct HeartbeatGuard {
    stop: Option<shutdown::Sender>,
    join: Option<JoinHandle<()>>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(h) = self.join.take() {
            let _ = h.join();
        }
    }
}

/// Spawns the background heartbeat paired with one job. The thread beats
/// every `interval` until the guard drops, and treats individual failures as
/// non-fatal.
fn spawn_heartbeat<C: Clocks>(
    db: Arc<Database<C>>,
    job_id: i64,
    interval: Duration,
) -> HeartbeatGuard {
    let (stop, rx) = shutdown::channel();
    let join = std::thread::Builder::new()
        .name(format!("heartbeat-{job_id}"))
        .spawn(move || {
            while rx.wait_for(interval).is_ok() {
                if let Err(e) = db.heartbeat(job_id) {
                    warn!(job_id, err = %e.chain(), "heartbeat failed; will retry");
                }
            }
        })
        .expect("spawning heartbeat thread");
    HeartbeatGuard {
        stop: Some(stop),
        join: Some(join),
    }
}

/// The worker's main loop: reclaim stale rows periodically, claim the next
/// queued job, run it, repeat. Unexpected errors log and back off one poll
/// interval rather than killing the process.
pub fn poll_loop<C: Clocks>(runner: &Runner<C>, shutdown: &shutdown::Receiver) {
    info!("polling for queued jobs");
    let mut last_reclaim: Option<Duration> = None;
    loop {
        if shutdown.check().is_err() {
            break;
        }
        let now = runner.db.clocks().monotonic();
        if last_reclaim.map_or(true, |t| now.saturating_sub(t) >= RECLAIM_INTERVAL) {
            if let Err(e) = runner.db.reclaim_stale(runner.cfg.stale_job) {
                warn!(err = %e.chain(), "stale reclaim failed");
            }
            last_reclaim = Some(now);
        }
        match runner.db.claim_next() {
            Ok(Some(job_id)) => runner.run_job(job_id),
            Ok(None) => {
                if shutdown.wait_for(runner.cfg.poll_interval).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(err = %e.chain(), "claim failed");
                if shutdown.wait_for(runner.cfg.poll_interval).is_err() {
                    break;
                }
            }
        }
    }
    info!("worker loop stopped");
}
