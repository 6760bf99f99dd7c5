// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Speech-to-text seam and the whisper-CLI backend.
//!
//! Downstream stages only ever see the normalized form: ordered segments,
//! each with a non-empty list of word timings. Segments that lack word-level
//! timing are dropped at normalization; a transcript with nothing left is
//! fatal to the job.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use base::{bail, err, Error, ErrorKind};
use serde::Deserialize;
use tracing::debug;

use crate::ffmpeg;

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq)]
pub struct Word {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub words: Vec<Word>,
}

#[derive(Clone, Debug, Default)]
pub struct Transcript {
    pub segments: Vec<Segment>,
}

impl Transcript {
    /// Flat, start-ordered word stream across all segments.
    pub fn words(&self) -> Vec<Word> {
        let mut words: Vec<Word> = self
            .segments
            .iter()
            .flat_map(|s| s.words.iter().cloned())
            .collect();
        words.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
        words
    }
}

pub trait Transcriber: Send + Sync {
    /// Transcribes a mono 16 kHz WAV into the normalized form.
    fn transcribe(&self, wav: &Path) -> Result<Transcript, Error>;
}

/// Backend invoking the `whisper` CLI with word timestamps and JSON output.
pub struct WhisperCli {
    binary: PathBuf,
    model: String,
}

impl WhisperCli {
    pub fn locate(binary_name: &str, model: &str) -> Result<Self, Error> {
        Ok(WhisperCli {
            binary: ffmpeg::locate_tool(binary_name)?,
            model: model.to_owned(),
        })
    }
}

impl Transcriber for WhisperCli {
    fn transcribe(&self, wav: &Path) -> Result<Transcript, Error> {
        let out_dir = wav
            .parent()
            .ok_or_else(|| err!(Internal, msg("wav path has no parent")))?;
        let mut cmd = Command::new(&self.binary);
        cmd.arg(wav)
            .args(["--model", &self.model])
            .args(["--task", "transcribe"])
            .args(["--output_format", "json"])
            .arg("--output_dir")
            .arg(out_dir)
            .args(["--word_timestamps", "True"])
            .args(["--fp16", "False"])
            .args(["--temperature", "0"])
            .args(["--verbose", "False"]);
        ffmpeg::run(cmd, TRANSCRIBE_TIMEOUT, "whisper", ErrorKind::TranscribeFailed)?;

        let stem = wav
            .file_stem()
            .ok_or_else(|| err!(Internal, msg("wav path has no stem")))?;
        let json_path = out_dir.join(stem).with_extension("json");
        let raw = std::fs::read(&json_path).map_err(|e| {
            err!(
                TranscribeFailed,
                msg("whisper produced no output at {}", json_path.display()),
                source(e)
            )
        })?;
        normalize(&raw)
    }
}

#[derive(Deserialize)]
struct RawTranscript {
    #[serde(default)]
    segments: Vec<RawSegment>,
}

#[derive(Deserialize)]
struct RawSegment {
    start: Option<f64>,
    end: Option<f64>,
    text: Option<String>,
    #[serde(default)]
    words: Vec<RawWord>,
}

#[derive(Deserialize)]
struct RawWord {
    start: Option<f64>,
    end: Option<f64>,
    word: Option<String>,
}

/// Parses raw whisper JSON into the normalized transcript.
pub fn normalize(raw: &[u8]) -> Result<Transcript, Error> {
    let parsed: RawTranscript = serde_json::from_slice(raw)
        .map_err(|e| err!(TranscribeFailed, msg("unreadable transcript JSON"), source(e)))?;

    let mut segments = Vec::new();
    let mut dropped = 0usize;
    for seg in parsed.segments {
        let mut words = Vec::new();
        for w in seg.words {
            let (Some(start), Some(end), Some(text)) = (w.start, w.end, w.word) else {
                continue;
            };
            let text = text.trim().to_owned();
            if text.is_empty() || end < start {
                continue;
            }
            words.push(Word { start, end, text });
        }
        if words.is_empty() {
            dropped += 1;
            continue;
        }
        words.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
        let start = seg.start.unwrap_or(words[0].start);
        let end = seg.end.unwrap_or(words[words.len() - 1].end);
        let text = match seg.text {
            Some(t) if !t.trim().is_empty() => t.trim().to_owned(),
            _ => words
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        };
        segments.push(Segment {
            start,
            end,
            text,
            words,
        });
    }
    if dropped > 0 {
        debug!("dropped {dropped} segment(s) without word timing");
    }
    if segments.is_empty() {
        bail!(TranscribeFailed, msg("transcript is empty"));
    }
    segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
    Ok(Transcript { segments })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_words_and_drops_timingless_segments() {
        let raw = br#"{
            "segments": [
                {"start": 0.0, "end": 2.0, "text": " Hello there. ",
                 "words": [
                    {"start": 0.1, "end": 0.6, "word": " Hello"},
                    {"start": 0.7, "end": 1.4, "word": " there."}
                 ]},
                {"start": 2.0, "end": 4.0, "text": "No timing here."},
                {"start": 4.0, "end": 5.0, "text": "Partial",
                 "words": [{"word": "Partial"}]}
            ]
        }"#;
        let t = normalize(raw).unwrap();
        assert_eq!(t.segments.len(), 1);
        assert_eq!(t.segments[0].text, "Hello there.");
        let words = t.words();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "Hello");
        assert_eq!(words[1].text, "there.");
    }

    #[test]
    fn empty_transcript_is_fatal() {
        let e = normalize(br#"{"segments": []}"#).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TranscribeFailed);

        let all_dropped = br#"{"segments": [{"start": 0, "end": 1, "text": "x"}]}"#;
        let e = normalize(all_dropped).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TranscribeFailed);
    }

    #[test]
    fn words_are_globally_ordered() {
        let raw = br#"{
            "segments": [
                {"start": 5.0, "end": 6.0, "text": "b",
                 "words": [{"start": 5.0, "end": 5.5, "word": "b"}]},
                {"start": 0.0, "end": 1.0, "text": "a",
                 "words": [{"start": 0.0, "end": 0.5, "word": "a"}]}
            ]
        }"#;
        let t = normalize(raw).unwrap();
        let words = t.words();
        assert_eq!(words[0].text, "a");
        assert_eq!(words[1].text, "b");
    }

    #[test]
    fn garbage_json_is_transcribe_failed() {
        assert_eq!(
            normalize(b"<html>").unwrap_err().kind(),
            ErrorKind::TranscribeFailed
        );
    }
}
