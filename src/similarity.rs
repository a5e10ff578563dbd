//! Title similarity scoring.
//!
//! Scores live on a 0–100 scale. Implementations must be symmetric and give
//! the maximum to identical non-empty inputs.

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

/// Highest score a [`TitleScorer`] may return.
pub const MAX_SCORE: f64 = 100.0;

/// Compares two already-normalized titles.
pub trait TitleScorer {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Token-set comparison: word order and extra words on one side do not lower
/// the score as long as one token set contains the other.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSetScorer;

impl TitleScorer for TokenSetScorer {
    fn score(&self, a: &str, b: &str) -> f64 {
        token_set_ratio(a, b)
    }
}

impl<F> TitleScorer for F
where
    F: Fn(&str, &str) -> f64,
{
    fn score(&self, a: &str, b: &str) -> f64 {
        self(a, b)
    }
}

/// Splits on anything that is not alphanumeric and returns the sorted,
/// de-duplicated tokens.
pub fn tokens(text: &str) -> BTreeSet<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Computes the token-set ratio of two titles.
///
/// The intersection `t0` and the two "intersection + remainder" strings `t1`
/// and `t2` are compared pairwise with normalized Levenshtein similarity; the
/// best of the three wins. Identical non-empty inputs always score the
/// maximum, even when they hold no alphanumeric tokens ("♪♪♪"); otherwise a
/// side without tokens scores 0.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    if a == b && !a.is_empty() {
        return MAX_SCORE;
    }

    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let common = join(left.intersection(&right));
    let only_left = join(left.difference(&right));
    let only_right = join(right.difference(&left));

    let t1 = concat(&common, &only_left);
    let t2 = concat(&common, &only_right);

    let best = normalized_levenshtein(&common, &t1)
        .max(normalized_levenshtein(&common, &t2))
        .max(normalized_levenshtein(&t1, &t2));

    (best * MAX_SCORE).clamp(0.0, MAX_SCORE)
}

fn join<'s, 'a: 's>(parts: impl Iterator<Item = &'s &'a str>) -> String {
    parts.copied().collect::<Vec<_>>().join(" ")
}

fn concat(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_owned(),
        (false, true) => head.to_owned(),
        (false, false) => format!("{head} {tail}"),
    }
}
