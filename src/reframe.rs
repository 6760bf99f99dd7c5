// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Camera path: a time-indexed crop center that keeps the subject framed.
//!
//! Detection is sampled sparsely, spike-clamped, exponentially smoothed, and
//! clamped so the crop window never leaves the source. Queries linearly
//! interpolate between samples. Without any detector the path is a constant
//! center biased toward the upper-middle, which frames talking heads well.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use base::{err, Error, ErrorKind};
use serde::Deserialize;

use crate::config::ReframeOpts;
use crate::ffmpeg;
use crate::segment::ClipPlan;

/// Motion score reported when no detection capability is available.
const NEUTRAL_MOTION_SCORE: f64 = 0.60;

/// Mean center speed (px/s) at which the motion score halves.
const SPEED_REF: f64 = 240.0;

/// Mean speed change (px/s²) at which the motion score halves.
const JERK_REF: f64 = 2400.0;

/// One face detection in source pixels.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct FaceBox {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub score: f64,
}

/// One sampled frame's detections.
#[derive(Clone, Debug, Deserialize)]
pub struct DetectedFrame {
    pub t: f64,
    #[serde(default)]
    pub faces: Vec<FaceBox>,
    /// Torso center fallback when no face is visible.
    #[serde(default)]
    pub pose: Option<(f64, f64)>,
}

/// Face/pose sampling seam. Constructed once at process start and passed by
/// reference into the reframe stage.
pub trait SubjectDetector: Send + Sync {
    /// Samples `[start, end]` at `fps` frames per second, in order.
    fn sample(&self, video: &Path, start: f64, end: f64, fps: f64)
        -> Result<Vec<DetectedFrame>, Error>;
}

/// Detector backed by an external executable that prints a JSON array of
/// per-frame detections.
pub struct CommandDetector {
    program: PathBuf,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        CommandDetector { program, timeout }
    }
}

impl SubjectDetector for CommandDetector {
    fn sample(
        &self,
        video: &Path,
        start: f64,
        end: f64,
        fps: f64,
    ) -> Result<Vec<DetectedFrame>, Error> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--input")
            .arg(video)
            .args(["--start", &format!("{start:.3}")])
            .args(["--end", &format!("{end:.3}")])
            .args(["--fps", &format!("{fps:.3}")]);
        let out = ffmpeg::run(cmd, self.timeout, "subject detector", ErrorKind::Internal)?;
        serde_json::from_slice(&out)
            .map_err(|e| err!(Internal, msg("unreadable detector output"), source(e)))
    }
}

/// The crop-center trajectory for one plan, in source pixels.
#[derive(Clone, Debug)]
pub struct CameraPath {
    /// `(t, cx, cy)`, ordered by `t`. Never empty.
    samples: Vec<(f64, f64, f64)>,
    pub motion_score: f64,
    crop_w: u32,
    crop_h: u32,
}

impl CameraPath {
    pub fn crop_size(&self) -> (u32, u32) {
        (self.crop_w, self.crop_h)
    }

    /// Crop center at `t` (source-relative seconds), linearly interpolated.
    pub fn center_at(&self, t: f64) -> (f64, f64) {
        let s = &self.samples;
        if t <= s[0].0 {
            return (s[0].1, s[0].2);
        }
        if t >= s[s.len() - 1].0 {
            let last = s[s.len() - 1];
            return (last.1, last.2);
        }
        let i = s.partition_point(|&(st, _, _)| st <= t);
        let (t0, x0, y0) = s[i - 1];
        let (t1, x1, y1) = s[i];
        let f = if t1 > t0 { (t - t0) / (t1 - t0) } else { 0.0 };
        (x0 + (x1 - x0) * f, y0 + (y1 - y0) * f)
    }

    /// Median of the centers in the first `window` seconds of the path.
    pub fn early_center(&self, window: f64) -> (f64, f64) {
        let t0 = self.samples[0].0;
        self.window_median(|t| t <= t0 + window)
    }

    /// Median of the centers in the last `window` seconds of the path.
    pub fn late_center(&self, window: f64) -> (f64, f64) {
        let t1 = self.samples[self.samples.len() - 1].0;
        self.window_median(|t| t >= t1 - window)
    }

    /// Median vertical center across the whole path, for caption placement.
    pub fn median_cy(&self) -> f64 {
        median(self.samples.iter().map(|&(_, _, cy)| cy).collect())
    }

    fn window_median(&self, keep: impl Fn(f64) -> bool) -> (f64, f64) {
        let xs: Vec<f64> = self
            .samples
            .iter()
            .filter(|&&(t, _, _)| keep(t))
            .map(|&(_, x, _)| x)
            .collect();
        let ys: Vec<f64> = self
            .samples
            .iter()
            .filter(|&&(t, _, _)| keep(t))
            .map(|&(_, _, y)| y)
            .collect();
        if xs.is_empty() {
            let first = self.samples[0];
            return (first.1, first.2);
        }
        (median(xs), median(ys))
    }
}

fn median(mut v: Vec<f64>) -> f64 {
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        (v[n / 2 - 1] + v[n / 2]) / 2.0
    }
}

/// Letterbox-free cover crop: the largest window with the target aspect that
/// fits inside the source. Dimensions forced even for the encoder.
pub fn crop_window(src_w: u32, src_h: u32, tgt_w: u32, tgt_h: u32) -> (u32, u32) {
    let tgt_aspect = tgt_w as f64 / tgt_h as f64;
    let mut crop_h = src_h as f64;
    let mut crop_w = crop_h * tgt_aspect;
    if crop_w > src_w as f64 {
        crop_w = src_w as f64;
        crop_h = crop_w / tgt_aspect;
    }
    let even = |v: f64| ((v as u32) & !1).max(2);
    (even(crop_w).min(src_w), even(crop_h).min(src_h))
}

/// Builds the camera path for one plan.
pub fn plan_camera(
    detector: Option<&dyn SubjectDetector>,
    video: &Path,
    plan: &ClipPlan,
    src: (u32, u32),
    tgt: (u32, u32),
    opts: &ReframeOpts,
) -> Result<CameraPath, Error> {
    let (crop_w, crop_h) = crop_window(src.0, src.1, tgt.0, tgt.1);
    let Some(detector) = detector else {
        return Ok(constant_path(plan, src, (crop_w, crop_h), opts));
    };
    let frames = detector.sample(video, plan.start, plan.end, opts.sample_fps)?;
    if frames.is_empty() {
        return Ok(constant_path(plan, src, (crop_w, crop_h), opts));
    }

    let fallback = fallback_center(src, opts);
    let bounds = CenterBounds::new(src, (crop_w, crop_h));
    let mut samples: Vec<(f64, f64, f64)> = Vec::with_capacity(frames.len());
    for frame in &frames {
        let raw = raw_center(frame, fallback);
        let next = match samples.last() {
            None => bounds.clamp(raw),
            Some(&(_, px, py)) => {
                // Per-sample step clamp suppresses detector spikes; the
                // exponential filter then smooths what remains.
                let stepped = (
                    px + (raw.0 - px).clamp(-opts.max_step_px, opts.max_step_px),
                    py + (raw.1 - py).clamp(-opts.max_step_px, opts.max_step_px),
                );
                let a = opts.smoothing;
                bounds.clamp((a * px + (1.0 - a) * stepped.0, a * py + (1.0 - a) * stepped.1))
            }
        };
        samples.push((frame.t, next.0, next.1));
    }

    let motion_score = motion_score(&samples, opts.sample_fps);
    Ok(CameraPath {
        samples,
        motion_score,
        crop_w,
        crop_h,
    })
}

/// Constant center path used when no detection capability is available.
fn constant_path(
    plan: &ClipPlan,
    src: (u32, u32),
    crop: (u32, u32),
    opts: &ReframeOpts,
) -> CameraPath {
    let bounds = CenterBounds::new(src, crop);
    let c = bounds.clamp(fallback_center(src, opts));
    CameraPath {
        samples: vec![(plan.start, c.0, c.1), (plan.end, c.0, c.1)],
        motion_score: NEUTRAL_MOTION_SCORE,
        crop_w: crop.0,
        crop_h: crop.1,
    }
}

fn fallback_center(src: (u32, u32), opts: &ReframeOpts) -> (f64, f64) {
    (src.0 as f64 / 2.0, opts.center_bias_y * src.1 as f64)
}

fn raw_center(frame: &DetectedFrame, fallback: (f64, f64)) -> (f64, f64) {
    if let Some(face) = frame
        .faces
        .iter()
        .max_by(|a, b| (a.w * a.h).partial_cmp(&(b.w * b.h)).unwrap())
    {
        return (face.cx, face.cy);
    }
    if let Some((px, py)) = frame.pose {
        return (px, py);
    }
    fallback
}

/// Valid range for a crop center such that the window stays inside the
/// source.
struct CenterBounds {
    x: (f64, f64),
    y: (f64, f64),
}

impl CenterBounds {
    fn new(src: (u32, u32), crop: (u32, u32)) -> Self {
        let half_w = crop.0 as f64 / 2.0;
        let half_h = crop.1 as f64 / 2.0;
        CenterBounds {
            x: (half_w, (src.0 as f64 - half_w).max(half_w)),
            y: (half_h, (src.1 as f64 - half_h).max(half_h)),
        }
    }

    fn clamp(&self, c: (f64, f64)) -> (f64, f64) {
        (c.0.clamp(self.x.0, self.x.1), c.1.clamp(self.y.0, self.y.1))
    }
}

/// Smoothness in [0, 1] from mean center speed and its first derivative.
fn motion_score(samples: &[(f64, f64, f64)], fps: f64) -> f64 {
    if samples.len() < 2 {
        return 1.0;
    }
    let speeds: Vec<f64> = samples
        .windows(2)
        .map(|w| {
            let dx = w[1].1 - w[0].1;
            let dy = w[1].2 - w[0].2;
            (dx * dx + dy * dy).sqrt() * fps
        })
        .collect();
    let mean_speed = speeds.iter().sum::<f64>() / speeds.len() as f64;
    let mean_jerk = if speeds.len() < 2 {
        0.0
    } else {
        speeds
            .windows(2)
            .map(|w| (w[1] - w[0]).abs() * fps)
            .sum::<f64>()
            / (speeds.len() - 1) as f64
    };
    (1.0 / (1.0 + mean_speed / SPEED_REF + mean_jerk / JERK_REF)).clamp(0.0, 1.0)
}
