// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Segmentation: word stream → utterances → clip plans.
//!
//! Two passes. Utterances are contiguous word runs bounded by pauses,
//! sentence-ending punctuation, or a length cap. Plans accumulate utterances
//! toward a target duration, merging across tiny gaps up to the hard maximum,
//! then snap their boundaries to nearby silence edges. The result is always
//! non-empty: a silent or too-short source degrades to a single plan covering
//! the head of the video.

use crate::transcribe::Word;

/// Start a new utterance when the pause between words reaches this.
const UTTERANCE_PAUSE: f64 = 0.55;

/// Start a new utterance once the current one reaches this length.
const UTTERANCE_MAX_SECONDS: f64 = 12.0;

/// How far a clip boundary may move to land on a silence edge.
const SNAP_WINDOW: f64 = 0.15;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Utterance {
    pub start: f64,
    pub end: f64,
}

/// A candidate for rendering, prior to scoring.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipPlan {
    pub start: f64,
    pub end: f64,
}

impl ClipPlan {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &ClipPlan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlanLimits {
    pub min: f64,
    pub target: f64,
    pub max: f64,
    pub max_gap_merge: f64,
}

/// Splits the flat word stream into utterances.
pub fn build_utterances(words: &[Word]) -> Vec<Utterance> {
    let mut out = Vec::new();
    let mut cur: Option<Utterance> = None;
    let mut prev_ended_sentence = false;

    for w in words {
        match cur.as_mut() {
            None => cur = Some(Utterance { start: w.start, end: w.end }),
            Some(u) => {
                let pause = w.start - u.end;
                let over_long = u.end - u.start >= UTTERANCE_MAX_SECONDS;
                if pause >= UTTERANCE_PAUSE || over_long || prev_ended_sentence {
                    out.push(*u);
                    cur = Some(Utterance { start: w.start, end: w.end });
                } else {
                    u.end = u.end.max(w.end);
                }
            }
        }
        prev_ended_sentence = ends_sentence(&w.text);
    }
    if let Some(u) = cur {
        out.push(u);
    }
    out
}

fn ends_sentence(text: &str) -> bool {
    text.chars()
        .last()
        .is_some_and(|c| matches!(c, '.' | '!' | '?' | '…'))
}

/// Builds the plan list. Guaranteed non-empty, non-overlapping, and ordered.
pub fn build_plans(
    utterances: &[Utterance],
    silences: &[(f64, f64)],
    source_duration: f64,
    limits: &PlanLimits,
) -> Vec<ClipPlan> {
    let mut plans = Vec::new();
    let mut cur: Option<(f64, f64)> = None;

    let flush = |span: (f64, f64), plans: &mut Vec<ClipPlan>| {
        let plan = snap_to_silence(span.0, span.1, silences, source_duration);
        if plan.duration() >= limits.min {
            plans.push(plan);
        }
    };

    for u in utterances {
        match cur {
            None => cur = Some((u.start, u.end)),
            Some((s, e)) => {
                let gap = u.start - e;
                let merged = u.end - s;
                // Accumulate toward the target across real pauses; across
                // tiny gaps (continuous speech) keep going up to the hard
                // maximum and let the chop pass below split the run.
                let merge =
                    merged <= limits.target || (gap <= limits.max_gap_merge && merged <= limits.max);
                if merge {
                    cur = Some((s, e.max(u.end)));
                } else {
                    flush((s, e), &mut plans);
                    cur = Some((u.start, u.end));
                }
            }
        }
    }
    if let Some(span) = cur {
        flush(span, &mut plans);
    }

    let mut plans = chop_overlong(&plans, limits);

    if plans.is_empty() {
        // Silent video, sparse speech, or everything under the minimum:
        // guarantee one clip off the head of the source.
        plans.push(ClipPlan {
            start: 0.0,
            end: source_duration.min(limits.target).max(0.0),
        });
    }
    plans
}

/// Moves a span's boundaries onto adjacent silence edges: the start onto a
/// silence's end, the end onto a silence's start, each within the snap
/// window.
fn snap_to_silence(
    mut start: f64,
    mut end: f64,
    silences: &[(f64, f64)],
    source_duration: f64,
) -> ClipPlan {
    if let Some(&(_, sil_end)) = silences
        .iter()
        .find(|&&(_, se)| (se - start).abs() <= SNAP_WINDOW)
    {
        start = sil_end;
    }
    if let Some(&(sil_start, _)) = silences
        .iter()
        .find(|&&(ss, _)| (ss - end).abs() <= SNAP_WINDOW)
    {
        end = sil_start;
    }
    start = start.clamp(0.0, source_duration);
    end = end.clamp(0.0, source_duration);
    ClipPlan { start, end }
}

/// Splits any plan longer than `max` into consecutive max-length sub-clips;
/// a remainder shorter than `min` is discarded.
fn chop_overlong(plans: &[ClipPlan], limits: &PlanLimits) -> Vec<ClipPlan> {
    let mut out = Vec::new();
    for p in plans {
        if p.duration() <= limits.max {
            out.push(*p);
            continue;
        }
        let mut at = p.start;
        while at < p.end {
            let piece_end = (at + limits.max).min(p.end);
            if piece_end - at >= limits.min {
                out.push(ClipPlan { start: at, end: piece_end });
            }
            at = piece_end;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PlanLimits = PlanLimits {
        min: 20.0,
        target: 35.0,
        max: 60.0,
        max_gap_merge: 0.6,
    };

    fn word(start: f64, end: f64, text: &str) -> Word {
        Word {
            start,
            end,
            text: text.to_owned(),
        }
    }

    /// `n` words of `dur` seconds each, separated by `gap`, starting at `t0`.
    fn word_run(t0: f64, n: usize, dur: f64, gap: f64) -> Vec<Word> {
        (0..n)
            .map(|i| {
                let s = t0 + i as f64 * (dur + gap);
                word(s, s + dur, "word")
            })
            .collect()
    }

    #[test]
    fn utterances_split_on_pause() {
        let mut words = word_run(0.0, 4, 0.3, 0.1);
        words.extend(word_run(3.0, 4, 0.3, 0.1)); // 1.3 s after previous end
        let utts = build_utterances(&words);
        assert_eq!(utts.len(), 2);
        assert!((utts[0].end - 1.5).abs() < 1e-9);
        assert!((utts[1].start - 3.0).abs() < 1e-9);
    }

    #[test]
    fn utterances_split_on_punctuation() {
        let words = vec![
            word(0.0, 0.4, "Stop"),
            word(0.5, 0.9, "here."),
            word(1.0, 1.4, "Next"),
            word(1.5, 1.9, "one"),
        ];
        let utts = build_utterances(&words);
        assert_eq!(utts.len(), 2);
        assert_eq!(utts[0].end, 0.9);
        assert_eq!(utts[1].start, 1.0);
    }

    #[test]
    fn utterances_split_on_length_cap() {
        // Continuous words, no pauses or punctuation: the 12 s cap splits.
        let words = word_run(0.0, 60, 0.4, 0.05);
        let utts = build_utterances(&words);
        assert!(utts.len() > 1);
        for u in &utts {
            assert!(u.end - u.start < UTTERANCE_MAX_SECONDS + 1.0);
        }
    }

    #[test]
    fn plans_accumulate_to_target_across_pauses() {
        // 8 s utterances separated by 1 s pauses: gap exceeds merge
        // threshold, so accumulation stops once the target would be passed.
        let utts: Vec<Utterance> = (0..8)
            .map(|i| {
                let s = i as f64 * 9.0;
                Utterance { start: s, end: s + 8.0 }
            })
            .collect();
        let plans = build_plans(&utts, &[], 100.0, &LIMITS);
        assert!(!plans.is_empty());
        for p in &plans {
            assert!(p.duration() <= LIMITS.target + 1e-9, "{p:?}");
        }
        assert!(plans[0].duration() >= LIMITS.min);
    }

    #[test]
    fn continuous_speech_merges_to_max_and_chops() {
        // 100 utterances of 1.2 s with 0.1 s gaps: one continuous run of
        // 129.9 s, which must come back as ~max-length pieces plus a
        // remainder of at least min, none exceeding max.
        let utts: Vec<Utterance> = (0..100)
            .map(|i| {
                let s = i as f64 * 1.3;
                Utterance { start: s, end: s + 1.2 }
            })
            .collect();
        let plans = build_plans(&utts, &[], 200.0, &LIMITS);
        assert!(plans.len() >= 2, "{plans:?}");
        for p in &plans {
            assert!(p.duration() <= LIMITS.max + 1e-6, "{p:?}");
            assert!(p.duration() >= LIMITS.min, "{p:?}");
        }
        for w in plans.windows(2) {
            assert!(!w[0].overlaps(&w[1]));
            assert!(w[0].end <= w[1].start + 1e-9);
        }
    }

    #[test]
    fn single_overlong_run_is_chopped() {
        // One 150 s utterance: two max-length pieces plus a 30 s remainder.
        let utts = vec![Utterance { start: 0.0, end: 150.0 }];
        let plans = build_plans(&utts, &[], 150.0, &LIMITS);
        assert_eq!(
            plans,
            vec![
                ClipPlan { start: 0.0, end: 60.0 },
                ClipPlan { start: 60.0, end: 120.0 },
                ClipPlan { start: 120.0, end: 150.0 },
            ]
        );
    }

    #[test]
    fn chop_discards_sub_minimum_remainder() {
        // 70 s run: one 60 s piece; the 10 s remainder is dropped.
        let utts = vec![Utterance { start: 0.0, end: 70.0 }];
        let plans = build_plans(&utts, &[], 70.0, &LIMITS);
        assert_eq!(plans, vec![ClipPlan { start: 0.0, end: 60.0 }]);
    }

    #[test]
    fn end_snaps_to_silence_start() {
        // Utterance run ending at 12.0 would be discarded (under min), so
        // pad it to clip length; silence starts at 32.05.
        let utts = vec![Utterance { start: 0.0, end: 32.0 }];
        let silences = vec![(32.05, 32.40)];
        let plans = build_plans(&utts, &silences, 60.0, &LIMITS);
        assert_eq!(plans.len(), 1);
        assert!((plans[0].end - 32.05).abs() < 1e-9, "{plans:?}");
    }

    #[test]
    fn start_snaps_to_silence_end() {
        let utts = vec![Utterance { start: 5.1, end: 40.0 }];
        let silences = vec![(4.2, 5.0)];
        let plans = build_plans(&utts, &silences, 60.0, &LIMITS);
        assert_eq!(plans.len(), 1);
        assert!((plans[0].start - 5.0).abs() < 1e-9, "{plans:?}");
    }

    #[test]
    fn distant_silence_does_not_snap() {
        let utts = vec![Utterance { start: 0.0, end: 30.0 }];
        let silences = vec![(31.0, 32.0)]; // 1 s away, outside the window
        let plans = build_plans(&utts, &silences, 60.0, &LIMITS);
        assert_eq!(plans[0].end, 30.0);
    }

    #[test]
    fn quiet_video_falls_back_to_single_head_clip() {
        // No utterances at all (no speech): one clip covering the whole 10 s
        // source even though it is under the minimum.
        let plans = build_plans(&[], &[], 10.0, &LIMITS);
        assert_eq!(plans, vec![ClipPlan { start: 0.0, end: 10.0 }]);
    }

    #[test]
    fn long_quiet_video_caps_fallback_at_target() {
        let plans = build_plans(&[], &[], 300.0, &LIMITS);
        assert_eq!(plans, vec![ClipPlan { start: 0.0, end: 35.0 }]);
    }

    #[test]
    fn sub_minimum_speech_falls_back() {
        // A single 5 s utterance is discarded as too short; fallback kicks in.
        let utts = vec![Utterance { start: 2.0, end: 7.0 }];
        let plans = build_plans(&utts, &[], 8.0, &LIMITS);
        assert_eq!(plans, vec![ClipPlan { start: 0.0, end: 8.0 }]);
    }

    #[test]
    fn full_pipeline_from_words() {
        // 90 s of continuous speech in sentence-sized utterances.
        let mut words = Vec::new();
        for i in 0..150 {
            let s = i as f64 * 0.6;
            let text = if i % 10 == 9 { "sentence." } else { "word" };
            words.push(word(s, s + 0.5, text));
        }
        let utts = build_utterances(&words);
        assert!(utts.len() >= 10);
        let plans = build_plans(&utts, &[], 90.0, &LIMITS);
        assert!(!plans.is_empty());
        for p in &plans {
            assert!(p.start >= 0.0 && p.end <= 90.0);
            assert!(p.duration() >= LIMITS.min && p.duration() <= LIMITS.max + 1e-6);
        }
    }
}
