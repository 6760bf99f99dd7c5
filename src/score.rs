// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Heuristic plan quality and non-overlapping top-K selection.

use crate::segment::ClipPlan;
use crate::transcribe::Word;

const DURATION_WEIGHT: f64 = 0.30;
const SPEECH_DENSITY_WEIGHT: f64 = 0.35;
const ENERGY_WEIGHT: f64 = 0.20;
const MOTION_WEIGHT: f64 = 0.15;

/// Words per second at which speech density saturates.
const FULL_DENSITY_WPS: f64 = 3.0;

/// How hard silence coverage drags a plan down.
const SILENCE_PENALTY: f64 = 0.75;

/// Deviation from the target duration (seconds) at which the duration score
/// halves.
const DURATION_TOLERANCE: f64 = 12.0;

#[derive(Clone, Debug)]
pub struct ScoredPlan {
    pub plan: ClipPlan,
    pub quality: f64,
}

/// Quality in [0, 1] for one plan.
pub fn score_plan(
    plan: &ClipPlan,
    words: &[Word],
    silences: &[(f64, f64)],
    audio_energy: f64,
    motion: f64,
    target_seconds: f64,
) -> f64 {
    let dur = plan.duration();
    if dur <= 0.0 {
        return 0.0;
    }
    let duration_score = 1.0 / (1.0 + (dur - target_seconds).abs() / DURATION_TOLERANCE);

    let word_count = words
        .iter()
        .filter(|w| w.end > plan.start && w.start < plan.end)
        .count();
    let speech_density = (word_count as f64 / dur / FULL_DENSITY_WPS).min(1.0);

    let silence_overlap: f64 = silences
        .iter()
        .map(|&(s, e)| (e.min(plan.end) - s.max(plan.start)).max(0.0))
        .sum();
    let silence_penalty = 1.0 - SILENCE_PENALTY * (silence_overlap / dur).clamp(0.0, 1.0);

    let q = (DURATION_WEIGHT * duration_score
        + SPEECH_DENSITY_WEIGHT * speech_density
        + ENERGY_WEIGHT * audio_energy.clamp(0.0, 1.0)
        + MOTION_WEIGHT * motion.clamp(0.0, 1.0))
        * silence_penalty;
    q.clamp(0.0, 1.0)
}

/// Greedy top-K: best quality first (duration breaks ties), rejecting any
/// candidate overlapping an already-chosen clip. Never returns empty for
/// non-empty input.
pub fn select_top(mut scored: Vec<ScoredPlan>, k: usize) -> Vec<ScoredPlan> {
    scored.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap()
            .then(b.plan.duration().partial_cmp(&a.plan.duration()).unwrap())
    });
    let mut chosen: Vec<ScoredPlan> = Vec::new();
    for cand in scored {
        if chosen.len() >= k {
            break;
        }
        if chosen.iter().all(|c| !c.plan.overlaps(&cand.plan)) {
            chosen.push(cand);
        }
    }
    chosen
}
