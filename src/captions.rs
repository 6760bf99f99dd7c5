// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Burned-in captions: paced blocks, wrapped lines, and a karaoke highlight
//! layer, emitted as an ASS document.
//!
//! The document's PlayRes equals the final output resolution so font sizes
//! and margins are scale-invariant. Each block emits two events: a base
//! layer with the plain wrapped text for the whole block, and a highlight
//! layer whose karaoke tags fill tokens in as they are spoken.

use std::fmt::Write as _;
use std::path::Path;

use base::{err, Error};
use serde::Deserialize;

use crate::config::CaptionOpts;
use crate::transcribe::Word;

/// Karaoke token duration clamp, in centiseconds.
const KARAOKE_MIN_CS: u32 = 2;
const KARAOKE_MAX_CS: u32 = 250;

/// Highlight fill color (BGR + alpha): yellow.
const HIGHLIGHT_COLOR: u32 = 0x0000FFFF;

/// Pre-highlight color on the karaoke layer: fully transparent, so the base
/// layer shows through until a token's time arrives.
const KARAOKE_SECONDARY_COLOR: u32 = 0xFF000000;

/// Subject-vertical thresholds (fraction of source height) that push the
/// captions up so they don't overlap a low-sitting subject.
const SUBJECT_LOW: f64 = 0.52;
const SUBJECT_LOWER: f64 = 0.58;

/// Caption styling resolved from worker defaults plus the job's style
/// document.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptionStyle {
    pub font: String,
    pub font_size: u32,
    /// BGR + alpha, ASS byte order.
    pub primary_color: u32,
    pub outline_color: u32,
    pub outline: u32,
    pub shadow: u32,
    pub margin_h: u32,
    pub margin_v: u32,
    /// Numpad alignment, 1-9.
    pub alignment: u8,
    pub bold: bool,
    pub italic: bool,
}

impl CaptionStyle {
    pub fn from_opts(o: &CaptionOpts) -> Self {
        CaptionStyle {
            font: o.font.clone(),
            font_size: o.font_size,
            primary_color: 0x00FF_FFFF,
            outline_color: 0x0000_0000,
            outline: o.outline,
            shadow: o.shadow,
            margin_h: o.margin_h,
            margin_v: o.margin_v,
            alignment: 2,
            bold: true,
            italic: false,
        }
    }

    /// Applies a job's caption-style document. Unknown keys are ignored;
    /// missing keys keep their defaults.
    pub fn with_overrides(mut self, json: &str) -> Result<Self, Error> {
        let doc: StyleDoc = serde_json::from_str(json)
            .map_err(|e| err!(Internal, msg("unreadable caption style document"), source(e)))?;
        if let Some(v) = doc.font {
            self.font = v;
        }
        if let Some(v) = doc.font_size {
            self.font_size = v;
        }
        if let Some(v) = doc.primary_color {
            self.primary_color = v;
        }
        if let Some(v) = doc.outline_color {
            self.outline_color = v;
        }
        if let Some(v) = doc.outline {
            self.outline = v;
        }
        if let Some(v) = doc.shadow {
            self.shadow = v;
        }
        if let Some(v) = doc.margin_h {
            self.margin_h = v;
        }
        if let Some(v) = doc.margin_v {
            self.margin_v = v;
        }
        if let Some(v) = doc.alignment {
            self.alignment = v.clamp(1, 9);
        }
        if let Some(v) = doc.bold {
            self.bold = v != 0;
        }
        if let Some(v) = doc.italic {
            self.italic = v != 0;
        }
        Ok(self)
    }
}

#[derive(Deserialize, Default)]
struct StyleDoc {
    font: Option<String>,
    font_size: Option<u32>,
    primary_color: Option<u32>,
    outline_color: Option<u32>,
    outline: Option<u32>,
    shadow: Option<u32>,
    margin_h: Option<u32>,
    margin_v: Option<u32>,
    alignment: Option<u8>,
    bold: Option<u8>,
    italic: Option<u8>,
}

/// Pacing limits for partitioning the word stream into blocks.
#[derive(Clone, Debug)]
pub struct CaptionPacing {
    pub max_lines: usize,
    pub max_words_per_line: usize,
    pub max_chars_per_line: usize,
    pub max_block_seconds: f64,
    pub silence_break: f64,
}

impl CaptionPacing {
    pub fn from_opts(o: &CaptionOpts) -> Self {
        CaptionPacing {
            max_lines: o.max_lines,
            max_words_per_line: o.max_words_per_line,
            max_chars_per_line: o.max_chars_per_line,
            max_block_seconds: o.max_block_seconds,
            silence_break: o.silence_break,
        }
    }

    /// Word-count cap per block: a full screen of lines plus a little slack.
    fn max_words_per_block(&self) -> usize {
        self.max_lines * self.max_words_per_line + 3
    }
}

/// One caption block in clip-local time.
#[derive(Clone, Debug)]
pub struct CaptionBlock {
    pub start: f64,
    pub end: f64,
    pub words: Vec<Word>,
}

/// Partitions the word stream restricted to `[clip_start, clip_end]` into
/// paced blocks with clip-local times.
pub fn build_blocks(
    words: &[Word],
    clip_start: f64,
    clip_end: f64,
    pacing: &CaptionPacing,
) -> Vec<CaptionBlock> {
    let dur = clip_end - clip_start;
    if dur <= 0.0 {
        return Vec::new();
    }
    let local: Vec<Word> = words
        .iter()
        .filter(|w| w.end > clip_start && w.start < clip_end)
        .map(|w| Word {
            start: (w.start - clip_start).max(0.0),
            end: (w.end - clip_start).min(dur),
            text: w.text.clone(),
        })
        .filter(|w| w.end > w.start)
        .collect();

    let mut blocks: Vec<CaptionBlock> = Vec::new();
    let mut cur: Vec<Word> = Vec::new();
    for w in local {
        let split = match cur.last() {
            None => false,
            Some(prev) => {
                cur.len() >= pacing.max_words_per_block()
                    || w.end - cur[0].start > pacing.max_block_seconds
                    || w.start - prev.end >= pacing.silence_break
            }
        };
        if split {
            blocks.push(block_from(std::mem::take(&mut cur)));
        }
        cur.push(w);
    }
    if !cur.is_empty() {
        blocks.push(block_from(cur));
    }
    blocks
}

fn block_from(words: Vec<Word>) -> CaptionBlock {
    CaptionBlock {
        start: words[0].start,
        end: words[words.len() - 1].end,
        words,
    }
}

/// Hard-wraps a block's words into at most `max_lines` lines; overflow past
/// the last line is merged into it rather than dropped.
fn wrap_lines(words: &[Word], pacing: &CaptionPacing) -> Vec<Vec<usize>> {
    let mut lines: Vec<Vec<usize>> = Vec::new();
    let mut cur: Vec<usize> = Vec::new();
    let mut cur_len = 0usize;
    for (i, w) in words.iter().enumerate() {
        let wlen = w.text.chars().count();
        let would_be = if cur.is_empty() { wlen } else { cur_len + 1 + wlen };
        if !cur.is_empty()
            && (cur.len() >= pacing.max_words_per_line || would_be > pacing.max_chars_per_line)
        {
            if lines.len() + 1 >= pacing.max_lines {
                // Last permitted line: keep appending.
                cur.push(i);
                cur_len = would_be;
                continue;
            }
            lines.push(std::mem::take(&mut cur));
            cur_len = 0;
        }
        cur_len = if cur.is_empty() { wlen } else { cur_len + 1 + wlen };
        cur.push(i);
    }
    if !cur.is_empty() {
        lines.push(cur);
    }
    lines
}

/// ASS timestamp: `H:MM:SS.CC`.
fn ass_time(t: f64) -> String {
    let mut cs = (t.max(0.0) * 100.0).round() as u64;
    let hh = cs / 360_000;
    cs -= hh * 360_000;
    let mm = cs / 6_000;
    cs -= mm * 6_000;
    let ss = cs / 100;
    cs -= ss * 100;
    format!("{hh}:{mm:02}:{ss:02}.{cs:02}")
}

/// Escapes text for an ASS dialogue line: backslashes, override braces, and
/// newlines.
fn escape_text(s: &str) -> String {
    s.replace('\\', r"\\")
        .replace('{', r"\{")
        .replace('}', r"\}")
        .replace('\n', r"\N")
}

fn karaoke_cs(w: &Word) -> u32 {
    (((w.end - w.start) * 100.0).round() as i64)
        .clamp(KARAOKE_MIN_CS as i64, KARAOKE_MAX_CS as i64) as u32
}

fn ass_color(c: u32) -> String {
    format!("&H{c:08X}")
}

fn ass_flag(b: bool) -> i32 {
    if b {
        -1
    } else {
        0
    }
}

/// Renders the full ASS document for one clip.
///
/// `subject_y_frac` is the subject's median vertical position normalized by
/// source height; a low subject lifts the captions' vertical margin.
pub fn render_ass(
    blocks: &[CaptionBlock],
    style: &CaptionStyle,
    play: (u32, u32),
    pacing: &CaptionPacing,
    subject_y_frac: Option<f64>,
) -> String {
    let margin_v = effective_margin_v(style.margin_v, subject_y_frac);
    let mut out = String::new();
    let _ = writeln!(out, "[Script Info]");
    let _ = writeln!(out, "ScriptType: v4.00+");
    let _ = writeln!(out, "WrapStyle: 2");
    let _ = writeln!(out, "PlayResX: {}", play.0);
    let _ = writeln!(out, "PlayResY: {}", play.1);
    let _ = writeln!(out, "ScaledBorderAndShadow: yes");
    let _ = writeln!(out);
    let _ = writeln!(out, "[V4+ Styles]");
    let _ = writeln!(
        out,
        "Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, \
         BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, \
         BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding"
    );
    for (name, primary, secondary) in [
        ("Default", style.primary_color, style.primary_color),
        ("Highlight", HIGHLIGHT_COLOR, KARAOKE_SECONDARY_COLOR),
    ] {
        let _ = writeln!(
            out,
            "Style: {name},{font},{size},{primary},{secondary},{outline_color},&H00000000,\
             {bold},{italic},0,0,100,100,0,0,1,{outline},{shadow},{align},{mh},{mh},{mv},1",
            font = style.font,
            size = style.font_size,
            primary = ass_color(primary),
            secondary = ass_color(secondary),
            outline_color = ass_color(style.outline_color),
            bold = ass_flag(style.bold),
            italic = ass_flag(style.italic),
            outline = style.outline,
            shadow = style.shadow,
            align = style.alignment,
            mh = style.margin_h,
            mv = margin_v,
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Events]");
    let _ = writeln!(
        out,
        "Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text"
    );

    for b in blocks {
        if b.words.is_empty() {
            continue;
        }
        let lines = wrap_lines(&b.words, pacing);
        let base: Vec<String> = lines
            .iter()
            .map(|line| {
                line.iter()
                    .map(|&i| escape_text(&b.words[i].text))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        let karaoke: Vec<String> = lines
            .iter()
            .map(|line| {
                line.iter()
                    .map(|&i| {
                        let w = &b.words[i];
                        format!("{{\\k{}}}{}", karaoke_cs(w), escape_text(&w.text))
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        let (st, en) = (ass_time(b.start), ass_time(b.end));
        let _ = writeln!(
            out,
            "Dialogue: 0,{st},{en},Default,,0,0,0,,{}",
            base.join(r"\N")
        );
        let _ = writeln!(
            out,
            "Dialogue: 1,{st},{en},Highlight,,0,0,0,,{}",
            karaoke.join(r"\N")
        );
    }
    out
}

pub fn write_ass(
    path: &Path,
    blocks: &[CaptionBlock],
    style: &CaptionStyle,
    play: (u32, u32),
    pacing: &CaptionPacing,
    subject_y_frac: Option<f64>,
) -> Result<(), Error> {
    let doc = render_ass(blocks, style, play, pacing, subject_y_frac);
    std::fs::write(path, doc)
        .map_err(|e| err!(Internal, msg("unable to write {}", path.display()), source(e)))
}

fn effective_margin_v(margin_v: u32, subject_y_frac: Option<f64>) -> u32 {
    let multiplier = match subject_y_frac {
        Some(f) if f > SUBJECT_LOWER => 1.4,
        Some(f) if f > SUBJECT_LOW => 1.2,
        _ => 1.0,
    };
    (margin_v as f64 * multiplier).round() as u32
}
