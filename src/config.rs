// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Worker configuration from `WORKER_*` environment variables.
//!
//! Everything that affects pipeline behavior is overridable; the defaults
//! are the tunings the pipeline was calibrated with. Parsing goes through a
//! lookup closure so tests don't have to mutate the process environment.

use std::path::PathBuf;
use std::time::Duration;

use base::{bail, Error};

#[derive(Clone, Debug)]
pub struct Config {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_job: Duration,
    pub tmp_dir: PathBuf,
    pub max_source_bytes: u64,

    /// Deadline for a single clip encode. Probe and audio extraction have
    /// their own much shorter fixed deadlines.
    pub ffmpeg_timeout: Duration,

    pub silence_db: f64,
    pub silence_min_dur: f64,

    pub clip_min_seconds: f64,
    pub clip_target_seconds: f64,
    pub clip_max_seconds: f64,
    pub max_gap_merge: f64,
    pub top_k_clips: usize,

    pub render: RenderOpts,
    pub reframe: ReframeOpts,
    pub caption: CaptionOpts,
    pub watermark: WatermarkOpts,

    pub credits_per_minute: i64,
    pub min_credits_per_job: i64,

    pub whisper_bin: String,
    pub whisper_model: String,

    /// External subject-detector executable; when unset the camera path
    /// degrades to a biased constant center.
    pub detector_cmd: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RenderOpts {
    pub crf: u32,
    pub preset: String,
    pub fps: u32,
}

#[derive(Clone, Debug)]
pub struct ReframeOpts {
    pub sample_fps: f64,
    pub smoothing: f64,
    pub max_step_px: f64,
    pub center_bias_y: f64,
}

#[derive(Clone, Debug)]
pub struct CaptionOpts {
    pub font: String,
    pub font_size: u32,
    pub outline: u32,
    pub shadow: u32,
    pub margin_v: u32,
    pub margin_h: u32,
    pub max_lines: usize,
    pub max_words_per_line: usize,
    pub max_chars_per_line: usize,
    pub max_block_seconds: f64,
    pub silence_break: f64,
}

#[derive(Clone, Debug)]
pub struct WatermarkOpts {
    pub text: String,
    pub font_file: PathBuf,
    pub alpha: f64,
    pub padding: u32,
    pub boxed: bool,
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
        let cfg = Config {
            poll_interval: secs(&lookup, "WORKER_POLL_INTERVAL", 2)?,
            heartbeat_interval: secs(&lookup, "WORKER_HEARTBEAT_INTERVAL", 10)?,
            stale_job: secs(&lookup, "WORKER_STALE_JOB_SECONDS", 1800)?,
            tmp_dir: lookup("WORKER_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_source_bytes: int(&lookup, "WORKER_MAX_SOURCE_BYTES", 2 << 30)?,
            ffmpeg_timeout: secs(&lookup, "WORKER_FFMPEG_TIMEOUT", 3600)?,
            silence_db: float(&lookup, "WORKER_SILENCE_DB", -35.0)?,
            silence_min_dur: float(&lookup, "WORKER_SILENCE_MIN_DUR", 0.35)?,
            clip_min_seconds: float(&lookup, "WORKER_CLIP_MIN_SECONDS", 20.0)?,
            clip_target_seconds: float(&lookup, "WORKER_CLIP_TARGET_SECONDS", 35.0)?,
            clip_max_seconds: float(&lookup, "WORKER_CLIP_MAX_SECONDS", 60.0)?,
            max_gap_merge: float(&lookup, "WORKER_MAX_GAP_MERGE", 0.6)?,
            top_k_clips: int(&lookup, "WORKER_TOP_K_CLIPS", 3)?,
            render: RenderOpts {
                crf: int(&lookup, "WORKER_RENDER_CRF", 20)?,
                preset: string(&lookup, "WORKER_RENDER_PRESET", "veryfast"),
                fps: int(&lookup, "WORKER_RENDER_FPS", 30)?,
            },
            reframe: ReframeOpts {
                sample_fps: float(&lookup, "WORKER_REFRAME_SAMPLE_FPS", 4.0)?,
                smoothing: float(&lookup, "WORKER_REFRAME_SMOOTHING", 0.85)?,
                max_step_px: float(&lookup, "WORKER_REFRAME_MAX_STEP_PX", 120.0)?,
                center_bias_y: float(&lookup, "WORKER_REFRAME_CENTER_BIAS_Y", 0.58)?,
            },
            caption: CaptionOpts {
                font: string(&lookup, "WORKER_CAPTION_FONT", "DejaVu Sans"),
                font_size: int(&lookup, "WORKER_CAPTION_FONT_SIZE", 56)?,
                outline: int(&lookup, "WORKER_CAPTION_OUTLINE", 5)?,
                shadow: int(&lookup, "WORKER_CAPTION_SHADOW", 2)?,
                margin_v: int(&lookup, "WORKER_CAPTION_MARGIN_V", 140)?,
                margin_h: int(&lookup, "WORKER_CAPTION_MARGIN_H", 90)?,
                max_lines: int(&lookup, "WORKER_CAPTION_MAX_LINES", 2)?,
                max_words_per_line: int(&lookup, "WORKER_CAPTION_MAX_WORDS_PER_LINE", 7)?,
                max_chars_per_line: int(&lookup, "WORKER_CAPTION_MAX_CHARS_PER_LINE", 34)?,
                max_block_seconds: float(&lookup, "WORKER_CAPTION_MAX_BLOCK_SECONDS", 2.8)?,
                silence_break: float(&lookup, "WORKER_CAPTION_SILENCE_BREAK", 0.65)?,
            },
            watermark: WatermarkOpts {
                text: string(&lookup, "WORKER_WATERMARK_TEXT", "reelcut"),
                font_file: PathBuf::from(string(
                    &lookup,
                    "WORKER_WATERMARK_FONT_FILE",
                    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
                )),
                alpha: float(&lookup, "WORKER_WATERMARK_ALPHA", 0.70)?,
                padding: int(&lookup, "WORKER_WATERMARK_PADDING", 28)?,
                boxed: boolean(&lookup, "WORKER_WATERMARK_BOX", false)?,
            },
            credits_per_minute: int(&lookup, "WORKER_CREDITS_PER_MINUTE", 1)?,
            min_credits_per_job: int(&lookup, "WORKER_MIN_CREDITS_PER_JOB", 1)?,
            whisper_bin: string(&lookup, "WORKER_WHISPER_BIN", "whisper"),
            whisper_model: string(&lookup, "WORKER_WHISPER_MODEL", "base"),
            detector_cmd: lookup("WORKER_DETECTOR_CMD").map(PathBuf::from),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if !(self.clip_min_seconds > 0.0
            && self.clip_min_seconds <= self.clip_target_seconds
            && self.clip_target_seconds <= self.clip_max_seconds)
        {
            bail!(
                ConfigError,
                msg(
                    "clip durations must satisfy 0 < min <= target <= max, got {}/{}/{}",
                    self.clip_min_seconds,
                    self.clip_target_seconds,
                    self.clip_max_seconds
                )
            );
        }
        if self.top_k_clips == 0 {
            bail!(ConfigError, msg("WORKER_TOP_K_CLIPS must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.reframe.smoothing) {
            bail!(
                ConfigError,
                msg(
                    "WORKER_REFRAME_SMOOTHING must be in [0, 1), got {}",
                    self.reframe.smoothing
                )
            );
        }
        if self.reframe.sample_fps <= 0.0 {
            bail!(ConfigError, msg("WORKER_REFRAME_SAMPLE_FPS must be positive"));
        }
        if !(0.0..=1.0).contains(&self.watermark.alpha) {
            bail!(
                ConfigError,
                msg("WORKER_WATERMARK_ALPHA must be in [0, 1], got {}", self.watermark.alpha)
            );
        }
        if self.render.fps == 0 {
            bail!(ConfigError, msg("WORKER_RENDER_FPS must be positive"));
        }
        if self.caption.max_lines == 0 || self.caption.max_words_per_line == 0 {
            bail!(ConfigError, msg("caption line limits must be positive"));
        }
        Ok(())
    }
}

fn string(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => v.trim().to_owned(),
        _ => default.to_owned(),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<Duration, Error> {
    Ok(Duration::from_secs(int(lookup, name, default)?))
}

fn int<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, Error>
where
    T: std::str::FromStr + Copy,
{
    match lookup(name) {
        None => Ok(default),
        Some(v) => match v.trim().parse() {
            Ok(n) => Ok(n),
            Err(_) => bail!(ConfigError, msg("invalid {name}: {v:?}")),
        },
    }
}

fn float(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: f64) -> Result<f64, Error> {
    match lookup(name) {
        None => Ok(default),
        Some(v) => match v.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            _ => bail!(ConfigError, msg("invalid {name}: {v:?}")),
        },
    }
}

fn boolean(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, Error> {
    match lookup(name) {
        None => Ok(default),
        Some(v) => match v.trim() {
            "1" | "true" | "True" => Ok(true),
            "0" | "false" | "False" => Ok(false),
            _ => bail!(ConfigError, msg("invalid {name}: {v:?}")),
        },
    }
}
