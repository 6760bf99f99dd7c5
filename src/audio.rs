// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Audio stage: PCM extraction, silence detection, and an energy score.
//!
//! The WAV (mono, 16 kHz, s16) feeds both the transcriber and the in-process
//! analysis here. Silence intervals later snap clip boundaries and penalize
//! plans that sit on dead air; the energy score feeds plan quality.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use base::{bail, err, Error, ErrorKind};

use crate::ffmpeg::{self, Toolchain};

pub const SAMPLE_RATE: u32 = 16_000;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(120);

/// Window for the silence detector's RMS, in seconds. Small enough that a
/// 0.35 s minimum silence spans many windows.
const SILENCE_WINDOW: f64 = 0.010;

/// Window for the energy score's RMS, in seconds.
const ENERGY_WINDOW: f64 = 0.050;

/// Everything downstream stages need from the audio track.
pub struct AudioAnalysis {
    pub silences: Vec<(f64, f64)>,
    pub energy_score: f64,
    /// Seconds of decoded audio.
    pub duration: f64,
}

pub fn analyze(
    samples: &[i16],
    sample_rate: u32,
    silence_db: f64,
    silence_min_dur: f64,
) -> AudioAnalysis {
    AudioAnalysis {
        silences: detect_silences(samples, sample_rate, silence_db, silence_min_dur),
        energy_score: energy_score(samples, sample_rate),
        duration: samples.len() as f64 / sample_rate as f64,
    }
}

/// Extracts mono 16 kHz s16 PCM into `wav_path`.
pub fn extract_wav(tc: &Toolchain, src: &Path, wav_path: &Path) -> Result<(), Error> {
    let mut cmd = Command::new(&tc.ffmpeg);
    cmd.arg("-y")
        .arg("-i")
        .arg(src)
        .args(["-vn", "-acodec", "pcm_s16le"])
        .args(["-ar", &SAMPLE_RATE.to_string(), "-ac", "1"])
        .arg(wav_path);
    ffmpeg::run(cmd, EXTRACT_TIMEOUT, "audio extraction", ErrorKind::CorruptMedia)?;
    Ok(())
}

/// Reads the extracted WAV back as raw samples. Empty output is fatal.
pub fn read_samples(wav_path: &Path) -> Result<Vec<i16>, Error> {
    let mut reader = hound::WavReader::open(wav_path)
        .map_err(|e| err!(CorruptMedia, msg("unreadable wav {}", wav_path.display()), source(e)))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        bail!(
            Internal,
            msg(
                "unexpected wav layout: {} ch / {} bit",
                spec.channels,
                spec.bits_per_sample
            )
        );
    }
    let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    let samples =
        samples.map_err(|e| err!(CorruptMedia, msg("truncated wav"), source(e)))?;
    if samples.is_empty() {
        bail!(CorruptMedia, msg("source has no audio samples"));
    }
    Ok(samples)
}

/// Returns `(start, end)` intervals (seconds) where the signal stays below
/// `threshold_db` (dBFS) for at least `min_dur` seconds.
pub fn detect_silences(
    samples: &[i16],
    sample_rate: u32,
    threshold_db: f64,
    min_dur: f64,
) -> Vec<(f64, f64)> {
    let win = ((sample_rate as f64 * SILENCE_WINDOW) as usize).max(1);
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;

    let close_run = |start: usize, end: usize, out: &mut Vec<(f64, f64)>| {
        let s = start as f64 / sample_rate as f64;
        let e = end as f64 / sample_rate as f64;
        if e - s >= min_dur {
            out.push((s, e));
        }
    };

    for (i, chunk) in samples.chunks(win).enumerate() {
        let quiet = rms_dbfs(chunk) < threshold_db;
        match (quiet, run_start) {
            (true, None) => run_start = Some(i * win),
            (false, Some(start)) => {
                close_run(start, i * win, &mut out);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        close_run(start, samples.len(), &mut out);
    }
    out
}

/// Spread-based energy score in [0, 1]: the gap between the 10th and 90th
/// percentile of windowed RMS, normalized by the 90th. Mean RMS would
/// overweight loud outliers and punish quiet speakers; dynamic range doesn't.
pub fn energy_score(samples: &[i16], sample_rate: u32) -> f64 {
    let win = ((sample_rate as f64 * ENERGY_WINDOW) as usize).max(1);
    let mut rms: Vec<f64> = samples.chunks(win).map(window_rms).collect();
    if rms.is_empty() {
        return 0.0;
    }
    rms.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p10 = rms[percentile_index(rms.len(), 0.10)];
    let p90 = rms[percentile_index(rms.len(), 0.90)];
    if p90 <= 0.0 {
        return 0.0;
    }
    ((p90 - p10) / p90).clamp(0.0, 1.0)
}

fn percentile_index(len: usize, q: f64) -> usize {
    (((len - 1) as f64) * q).round() as usize
}

/// RMS of a window, normalized to [0, 1].
fn window_rms(chunk: &[i16]) -> f64 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = chunk
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum_sq / chunk.len() as f64).sqrt()
}

fn rms_dbfs(chunk: &[i16]) -> f64 {
    let rms = window_rms(chunk);
    if rms <= 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * rms.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant-amplitude block of `secs` seconds.
    fn tone(amplitude: i16, secs: f64) -> Vec<i16> {
        let n = (secs * SAMPLE_RATE as f64) as usize;
        // Alternate sign so the signal has zero DC offset, like audio does.
        (0..n)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn detects_interior_silence() {
        // 1 s loud, 1 s near-silent, 1 s loud.
        let mut s = tone(8000, 1.0);
        s.extend(tone(0, 1.0));
        s.extend(tone(8000, 1.0));
        let silences = detect_silences(&s, SAMPLE_RATE, -35.0, 0.35);
        assert_eq!(silences.len(), 1);
        let (start, end) = silences[0];
        assert!((start - 1.0).abs() < 0.05, "start={start}");
        assert!((end - 2.0).abs() < 0.05, "end={end}");
    }

    #[test]
    fn short_dips_are_not_silence() {
        let mut s = tone(8000, 1.0);
        s.extend(tone(0, 0.2)); // under the 0.35 s minimum
        s.extend(tone(8000, 1.0));
        assert!(detect_silences(&s, SAMPLE_RATE, -35.0, 0.35).is_empty());
    }

    #[test]
    fn trailing_silence_is_closed() {
        let mut s = tone(8000, 1.0);
        s.extend(tone(0, 0.5));
        let silences = detect_silences(&s, SAMPLE_RATE, -35.0, 0.35);
        assert_eq!(silences.len(), 1);
        assert!((silences[0].1 - 1.5).abs() < 0.05);
    }

    #[test]
    fn energy_rewards_dynamic_range() {
        // Alternating loud/quiet speech-like signal has spread; a constant
        // tone has none.
        let mut dynamic = Vec::new();
        for _ in 0..5 {
            dynamic.extend(tone(12000, 0.3));
            dynamic.extend(tone(500, 0.3));
        }
        let flat = tone(12000, 3.0);
        let dynamic_score = energy_score(&dynamic, SAMPLE_RATE);
        let flat_score = energy_score(&flat, SAMPLE_RATE);
        assert!(dynamic_score > 0.5, "dynamic={dynamic_score}");
        assert!(flat_score < 0.1, "flat={flat_score}");
        assert!(dynamic_score <= 1.0);
    }

    #[test]
    fn energy_of_silence_is_zero() {
        assert_eq!(energy_score(&tone(0, 2.0), SAMPLE_RATE), 0.0);
        assert_eq!(energy_score(&[], SAMPLE_RATE), 0.0);
    }

    #[test]
    fn wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for s in tone(1234, 0.25) {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();

        let samples = read_samples(&path).unwrap();
        assert_eq!(samples.len(), (0.25 * SAMPLE_RATE as f64) as usize);
        assert_eq!(samples[0], 1234);
    }

    #[test]
    fn empty_wav_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        hound::WavWriter::create(&path, spec).unwrap().finalize().unwrap();
        let e = read_samples(&path).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::CorruptMedia);
    }
}
