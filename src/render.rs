// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-clip rendering: crop + pan + scale + subtitles + watermark, encoded
//! H.264/AAC with faststart for immediate playback.
//!
//! The pan is a linear glide between the camera path's early and late subject
//! centers, expressed directly in the crop filter so ffmpeg evaluates it per
//! frame; no intermediate frames ever touch this process.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use base::{bail, Error, ErrorKind};

use crate::config::{RenderOpts, WatermarkOpts};
use crate::ffmpeg::{self, Toolchain};
use crate::probe::{self, SourceInfo};
use crate::reframe::CameraPath;
use crate::segment::ClipPlan;

/// Window (seconds) over which the early/late subject centers are estimated.
const ENDPOINT_WINDOW: f64 = 1.0;

/// Watermark pulse: ~0.12 Hz, ±0.14 around the configured alpha.
const PULSE_HZ: f64 = 0.12;
const PULSE_AMPLITUDE: f64 = 0.14;

/// Watermark drift frequencies (Hz); unequal on purpose so the path traces a
/// Lissajous figure instead of a diagonal.
const DRIFT_HZ_X: f64 = 0.023;
const DRIFT_HZ_Y: f64 = 0.017;
const DRIFT_PHASE_Y: f64 = 1.3;

/// Watermark font size as a fraction of output height.
const WATERMARK_HEIGHT_FRAC: f64 = 0.03;

/// Everything needed to synthesize one clip file.
pub struct RenderRequest<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub plan: &'a ClipPlan,
    pub camera: &'a CameraPath,
    pub src_dims: (u32, u32),
    pub out_dims: (u32, u32),
    pub subtitles: Option<&'a Path>,
    pub watermark: Option<&'a WatermarkOpts>,
    pub opts: &'a RenderOpts,
}

/// Seam over the media toolchain, so the job runner is testable without
/// spawning ffmpeg.
pub trait Encoder: Send + Sync {
    fn probe(&self, path: &Path) -> Result<SourceInfo, Error>;
    fn extract_audio(&self, src: &Path, wav: &Path) -> Result<(), Error>;
    fn render(&self, req: &RenderRequest) -> Result<(), Error>;
}

pub struct FfmpegEncoder {
    tc: Toolchain,
    render_timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(tc: Toolchain, render_timeout: Duration) -> Self {
        FfmpegEncoder { tc, render_timeout }
    }
}

impl Encoder for FfmpegEncoder {
    fn probe(&self, path: &Path) -> Result<SourceInfo, Error> {
        probe::probe(&self.tc, path)
    }

    fn extract_audio(&self, src: &Path, wav: &Path) -> Result<(), Error> {
        crate::audio::extract_wav(&self.tc, src, wav)
    }

    fn render(&self, req: &RenderRequest) -> Result<(), Error> {
        let vf = build_filtergraph(req);
        let dur = req.plan.duration().max(0.01);
        let mut cmd = Command::new(&self.tc.ffmpeg);
        cmd.arg("-y")
            .args(["-ss", &format!("{:.3}", req.plan.start)])
            .args(["-t", &format!("{dur:.3}")])
            .arg("-i")
            .arg(req.source)
            .args(["-vf", &vf])
            .args(["-c:v", "libx264"])
            .args(["-profile:v", "high"])
            .args(["-preset", &req.opts.preset])
            .args(["-crf", &req.opts.crf.to_string()])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-c:a", "aac"])
            .args(["-b:a", "128k"])
            .args(["-movflags", "+faststart"])
            .arg("-shortest")
            .arg(req.output);
        ffmpeg::run(cmd, self.render_timeout, "clip encode", ErrorKind::EncodeFailed)?;

        let len = std::fs::metadata(req.output).map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            bail!(EncodeFailed, msg("encoder produced empty output"));
        }
        Ok(())
    }
}

/// Builds the full `-vf` chain for a request.
pub fn build_filtergraph(req: &RenderRequest) -> String {
    let mut parts = vec![crop_filter(req)];
    parts.push(format!("scale={}:{}", req.out_dims.0, req.out_dims.1));
    parts.push("setsar=1".to_owned());
    parts.push(format!("fps={}", req.opts.fps));
    if let Some(ass) = req.subtitles {
        parts.push(format!("subtitles='{}'", escape_filter_path(ass)));
    }
    if let Some(wm) = req.watermark {
        parts.push(watermark_filter(wm, req.out_dims.1));
    }
    parts.join(",")
}

fn crop_filter(req: &RenderRequest) -> String {
    let (cw, ch) = req.camera.crop_size();
    let dur = req.plan.duration().max(0.01);

    let clamp_corner = |c: f64, crop: u32, limit: u32| -> i64 {
        let max = limit.saturating_sub(crop) as f64;
        ((c - crop as f64 / 2.0).round()).clamp(0.0, max) as i64
    };
    let (ex, ey) = req.camera.early_center(ENDPOINT_WINDOW);
    let (lx, ly) = req.camera.late_center(ENDPOINT_WINDOW);
    let x0 = clamp_corner(ex, cw, req.src_dims.0);
    let y0 = clamp_corner(ey, ch, req.src_dims.1);
    let x1 = clamp_corner(lx, cw, req.src_dims.0);
    let y1 = clamp_corner(ly, ch, req.src_dims.1);

    if x0 == x1 && y0 == y1 {
        return format!("crop={cw}:{ch}:{x0}:{y0}");
    }
    format!(
        "crop={cw}:{ch}:x='{}':y='{}'",
        pan_expr(x0, x1, dur),
        pan_expr(y0, y1, dur)
    )
}

/// Linear glide from `a` to `b` over `dur` seconds, clamped at both ends.
/// Commas are safe bare: the expression is wrapped in filter quotes.
fn pan_expr(a: i64, b: i64, dur: f64) -> String {
    if a == b {
        return a.to_string();
    }
    format!("{a}+({})*min(max(t/{dur:.3},0),1)", b - a)
}

/// Drawtext watermark with a slow alpha pulse and a bounded Lissajous drift.
pub fn watermark_filter(wm: &WatermarkOpts, out_h: u32) -> String {
    let font_size = ((out_h as f64 * WATERMARK_HEIGHT_FRAC).round() as u32).max(16);
    let pad = wm.padding;
    let alpha = format!(
        "{:.2}+{PULSE_AMPLITUDE}*sin(2*PI*{PULSE_HZ}*t)",
        wm.alpha.clamp(PULSE_AMPLITUDE, 1.0 - PULSE_AMPLITUDE)
    );
    let x = format!("{pad}+(w-tw-{})*(0.5+0.5*sin(2*PI*{DRIFT_HZ_X}*t))", 2 * pad);
    let y = format!(
        "{pad}+(h-th-{})*(0.5+0.5*sin(2*PI*{DRIFT_HZ_Y}*t+{DRIFT_PHASE_Y}))",
        2 * pad
    );
    let mut f = format!(
        "drawtext=fontfile='{}':text='{}':fontsize={font_size}:fontcolor=white:alpha='{alpha}':x='{x}':y='{y}'",
        escape_filter_path(&wm.font_file),
        escape_drawtext(&wm.text),
    );
    if wm.boxed {
        f.push_str(":box=1:boxcolor=black@0.25:boxborderw=8");
    }
    f
}

/// Escapes a path for use inside a quoted filter option.
fn escape_filter_path(p: &Path) -> String {
    escape_drawtext(&p.display().to_string())
}

fn escape_drawtext(s: &str) -> String {
    s.replace('\\', r"\\")
        .replace(':', r"\:")
        .replace('\'', r"\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReframeOpts;
    use crate::reframe::{plan_camera, DetectedFrame, FaceBox, SubjectDetector};

    const REFRAME: ReframeOpts = ReframeOpts {
        sample_fps: 4.0,
        smoothing: 0.85,
        max_step_px: 120.0,
        center_bias_y: 0.58,
    };

    fn render_opts() -> RenderOpts {
        RenderOpts { crf: 20, preset: "veryfast".to_owned(), fps: 30 }
    }

    fn watermark_opts() -> WatermarkOpts {
        WatermarkOpts {
            text: "reelcut".to_owned(),
            font_file: PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
            alpha: 0.70,
            padding: 28,
            boxed: false,
        }
    }

    fn static_camera(plan: &ClipPlan) -> CameraPath {
        plan_camera(None, Path::new("x.mp4"), plan, (1920, 1080), (1080, 1920), &REFRAME).unwrap()
    }

    struct Moving;

    impl SubjectDetector for Moving {
        fn sample(
            &self,
            _v: &Path,
            start: f64,
            end: f64,
            fps: f64,
        ) -> Result<Vec<DetectedFrame>, Error> {
            let n = ((end - start) * fps) as usize + 1;
            Ok((0..n)
                .map(|i| {
                    let t = start + i as f64 / fps;
                    let frac = (t - start) / (end - start);
                    DetectedFrame {
                        t,
                        faces: vec![FaceBox {
                            cx: 500.0 + 800.0 * frac,
                            cy: 540.0,
                            w: 180.0,
                            h: 220.0,
                            score: 0.9,
                        }],
                        pose: None,
                    }
                })
                .collect())
        }
    }

    #[test]
    fn static_subject_gets_static_crop() {
        let plan = ClipPlan { start: 3.0, end: 33.0 };
        let camera = static_camera(&plan);
        let req = RenderRequest {
            source: Path::new("in.mp4"),
            output: Path::new("out.mp4"),
            plan: &plan,
            camera: &camera,
            src_dims: (1920, 1080),
            out_dims: (1080, 1920),
            subtitles: None,
            watermark: None,
            opts: &render_opts(),
        };
        let vf = build_filtergraph(&req);
        // 606x1080 cover crop centered at x=960: corner 657, y pinned to 0.
        assert!(vf.starts_with("crop=606:1080:657:0,"), "{vf}");
        assert!(vf.contains("scale=1080:1920"));
        assert!(vf.contains("setsar=1"));
        assert!(vf.contains("fps=30"));
        assert!(!vf.contains("subtitles"));
        assert!(!vf.contains("drawtext"));
    }

    #[test]
    fn moving_subject_gets_linear_pan() {
        let plan = ClipPlan { start: 0.0, end: 20.0 };
        let camera = plan_camera(
            Some(&Moving),
            Path::new("x.mp4"),
            &plan,
            (1920, 1080),
            (1080, 1920),
            &REFRAME,
        )
        .unwrap();
        let req = RenderRequest {
            source: Path::new("in.mp4"),
            output: Path::new("out.mp4"),
            plan: &plan,
            camera: &camera,
            src_dims: (1920, 1080),
            out_dims: (1080, 1920),
            subtitles: None,
            watermark: None,
            opts: &render_opts(),
        };
        let vf = build_filtergraph(&req);
        assert!(vf.contains("crop=606:1080:x='"), "{vf}");
        assert!(vf.contains("min(max(t/20.000"), "{vf}");
    }

    #[test]
    fn pan_expr_formats() {
        assert_eq!(pan_expr(100, 100, 10.0), "100");
        assert_eq!(pan_expr(100, 300, 10.0), "100+(200)*min(max(t/10.000,0),1)");
        assert_eq!(pan_expr(300, 100, 10.0), "300+(-200)*min(max(t/10.000,0),1)");
    }

    #[test]
    fn subtitles_and_watermark_are_appended_in_order() {
        let plan = ClipPlan { start: 0.0, end: 10.0 };
        let camera = static_camera(&plan);
        let wm = watermark_opts();
        let req = RenderRequest {
            source: Path::new("in.mp4"),
            output: Path::new("out.mp4"),
            plan: &plan,
            camera: &camera,
            src_dims: (1920, 1080),
            out_dims: (1080, 1920),
            subtitles: Some(Path::new("/tmp/c.ass")),
            watermark: Some(&wm),
            opts: &render_opts(),
        };
        let vf = build_filtergraph(&req);
        let subs_at = vf.find("subtitles=").unwrap();
        let wm_at = vf.find("drawtext=").unwrap();
        let scale_at = vf.find("scale=").unwrap();
        assert!(scale_at < subs_at && subs_at < wm_at, "{vf}");
        assert!(vf.contains(r"subtitles='/tmp/c.ass'"), "{vf}");
    }

    #[test]
    fn watermark_pulses_and_drifts() {
        let f = watermark_filter(&watermark_opts(), 1920);
        // ~3% of 1920.
        assert!(f.contains("fontsize=58"), "{f}");
        assert!(f.contains("alpha='0.70+0.14*sin(2*PI*0.12*t)'"), "{f}");
        assert!(f.contains("x='28+(w-tw-56)*(0.5+0.5*sin(2*PI*0.023*t))'"), "{f}");
        assert!(f.contains("sin(2*PI*0.017*t+1.3)"), "{f}");
        assert!(!f.contains("box=1"));

        let mut boxed = watermark_opts();
        boxed.boxed = true;
        assert!(watermark_filter(&boxed, 1920).contains("box=1:boxcolor=black@0.25"));
    }

    #[test]
    fn watermark_alpha_leaves_pulse_headroom() {
        let mut wm = watermark_opts();
        wm.alpha = 1.0;
        let f = watermark_filter(&wm, 1080);
        // Clamped so the pulse peak stays at or below 1.0.
        assert!(f.contains("alpha='0.86+0.14*"), "{f}");
    }

    #[test]
    fn filter_paths_are_escaped() {
        assert_eq!(
            escape_filter_path(Path::new("/a/b's:c.ass")),
            r"/a/b\'s\:c.ass"
        );
        assert_eq!(escape_drawtext("it's: fine"), r"it\'s\: fine");
    }
}
