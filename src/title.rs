// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clip titles: a filler-stripping heuristic, with an optional external hook
//! (an LLM, an editor, anything) that may decline by returning `None`.

use crate::transcribe::Word;

const MAX_TITLE_CHARS: usize = 60;

/// How many opening words of a clip feed the heuristic.
const TITLE_SOURCE_WORDS: usize = 14;

/// Leading tokens that carry no information. Matched case-insensitively
/// after trimming punctuation.
const FILLERS: &[&str] = &[
    "so", "um", "uh", "uhm", "okay", "ok", "well", "like", "right", "and", "but", "anyway",
    "yeah", "you", "know", "i", "mean",
];

/// Optional title source consulted before the heuristic.
pub trait TitleHook: Send + Sync {
    /// Returns a title for the opening text, or `None` to defer to the
    /// heuristic.
    fn suggest(&self, opening_text: &str) -> Option<String>;
}

/// Joins the first words of a clip into the text both the hook and the
/// heuristic work from.
pub fn opening_text(words: &[Word], clip_start: f64, clip_end: f64) -> String {
    words
        .iter()
        .filter(|w| w.start >= clip_start && w.start < clip_end)
        .take(TITLE_SOURCE_WORDS)
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strips leading fillers, capitalizes, and truncates on a word boundary.
/// Returns `None` when nothing usable remains.
pub fn heuristic_title(text: &str) -> Option<String> {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    while let Some(first) = tokens.first() {
        let bare: String = first
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(|c| c.to_lowercase())
            .collect();
        if FILLERS.contains(&bare.as_str()) {
            tokens.remove(0);
        } else {
            break;
        }
    }
    if tokens.is_empty() {
        return None;
    }

    let mut title = String::new();
    for tok in &tokens {
        let added = if title.is_empty() { tok.chars().count() } else { tok.chars().count() + 1 };
        if title.chars().count() + added > MAX_TITLE_CHARS - 1 {
            if title.is_empty() {
                // A single enormous token: hard-truncate it.
                title = tok.chars().take(MAX_TITLE_CHARS - 1).collect();
            }
            title.push('…');
            break;
        }
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(tok);
    }

    let mut chars = title.chars();
    let title = match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => return None,
    };
    Some(title)
}
