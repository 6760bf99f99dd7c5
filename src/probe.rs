// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Container probe: dimensions, duration, and rotation via ffprobe.
//!
//! Rotation matters because phone footage frequently stores a 90/270 rotate
//! tag; the crop math must run on display dimensions, not coded dimensions.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use base::{bail, err, Error, ErrorKind};
use serde::Deserialize;

use crate::ffmpeg::{self, Toolchain};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the preflight stage needs to know about a source container.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    /// Coded dimensions, before applying rotation.
    pub width: u32,
    pub height: u32,
    /// Seconds.
    pub duration: f64,
    /// Display rotation in degrees: 0, 90, 180, or 270.
    pub rotation: u32,
}

impl SourceInfo {
    /// Dimensions as displayed, i.e. with the rotate tag applied.
    pub fn display_dims(&self) -> (u32, u32) {
        if self.rotation == 90 || self.rotation == 270 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

pub fn probe(tc: &Toolchain, path: &Path) -> Result<SourceInfo, Error> {
    let mut cmd = Command::new(&tc.ffprobe);
    cmd.args(["-v", "error", "-select_streams", "v:0"])
        .args([
            "-show_entries",
            "stream=width,height:stream_tags=rotate:side_data_list:format=duration",
        ])
        .args(["-of", "json"])
        .arg(path);
    let out = ffmpeg::run(cmd, PROBE_TIMEOUT, "ffprobe", ErrorKind::CorruptMedia)?;
    parse_probe_output(&out)
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    tags: ProbeTags,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Deserialize, Default)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Deserialize)]
struct SideData {
    side_data_type: Option<String>,
    rotation: Option<f64>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_probe_output(stdout: &[u8]) -> Result<SourceInfo, Error> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| err!(CorruptMedia, msg("unreadable ffprobe output"), source(e)))?;
    let Some(stream) = parsed.streams.first() else {
        bail!(CorruptMedia, msg("no video stream found"));
    };
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => bail!(CorruptMedia, msg("invalid video dimensions")),
    };
    let duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    if !(duration > 0.0) {
        bail!(CorruptMedia, msg("non-positive duration {duration}"));
    }

    // Rotation lives in a stream tag on older muxers and in the display
    // matrix side data on newer ones.
    let mut rotation = stream
        .tags
        .rotate
        .as_deref()
        .and_then(|r| r.parse::<f64>().ok())
        .unwrap_or(0.0);
    if rotation == 0.0 {
        rotation = stream
            .side_data_list
            .iter()
            .find(|sd| {
                matches!(
                    sd.side_data_type.as_deref(),
                    Some("Display Matrix") | Some("Display Matrix Side Data")
                )
            })
            .and_then(|sd| sd.rotation)
            .unwrap_or(0.0);
    }
    let rotation = ((rotation.round() as i64).rem_euclid(360)) as u32;
    if rotation % 90 != 0 {
        bail!(CorruptMedia, msg("unsupported rotation {rotation}"));
    }

    Ok(SourceInfo {
        width,
        height,
        duration,
        rotation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_stream() {
        let json = br#"{
            "streams": [{"width": 1920, "height": 1080}],
            "format": {"duration": "62.5"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.duration, 62.5);
        assert_eq!(info.rotation, 0);
        assert_eq!(info.display_dims(), (1920, 1080));
    }

    #[test]
    fn rotate_tag_swaps_display_dims() {
        let json = br#"{
            "streams": [{"width": 1920, "height": 1080, "tags": {"rotate": "90"}}],
            "format": {"duration": "10"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.rotation, 90);
        assert_eq!(info.display_dims(), (1080, 1920));
    }

    #[test]
    fn display_matrix_negative_rotation_normalizes() {
        let json = br#"{
            "streams": [{
                "width": 1920, "height": 1080,
                "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]
            }],
            "format": {"duration": "10"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.rotation, 270);
        assert_eq!(info.display_dims(), (1080, 1920));
    }

    #[test]
    fn rejects_bad_containers() {
        let no_stream = br#"{"streams": [], "format": {"duration": "10"}}"#;
        assert_eq!(
            parse_probe_output(no_stream).unwrap_err().kind(),
            ErrorKind::CorruptMedia
        );

        let zero_dims = br#"{"streams": [{"width": 0, "height": 1080}], "format": {"duration": "10"}}"#;
        assert_eq!(
            parse_probe_output(zero_dims).unwrap_err().kind(),
            ErrorKind::CorruptMedia
        );

        let no_duration = br#"{"streams": [{"width": 640, "height": 480}], "format": {}}"#;
        assert_eq!(
            parse_probe_output(no_duration).unwrap_err().kind(),
            ErrorKind::CorruptMedia
        );

        assert_eq!(
            parse_probe_output(b"not json").unwrap_err().kind(),
            ErrorKind::CorruptMedia
        );
    }
}
