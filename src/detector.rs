//! Near-duplicate song detection over a list of resolved candidates.
//!
//! Every unordered pair of candidates is scored on normalized titles, pairs at
//! or above the threshold are linked, and links are merged transitively with a
//! disjoint-set forest. A chain "Song" ~ "Song Remix" ~ "Remix" therefore ends
//! up in one group even if its endpoints alone would not pass.
//!
//! The pairwise pass is O(n²) in the number of candidates. Inputs are
//! user-sized analysis batches (tens to a few hundred items), so the quadratic
//! scan is kept as is.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::normalize::{Normalizer, extract_song_name};
use crate::similarity::{MAX_SCORE, TitleScorer, TokenSetScorer};

/// Threshold used when the caller does not provide one.
pub const DEFAULT_THRESHOLD: f64 = 80.0;

/// Stricter default used together with [`MatchMode::SongName`].
pub const SONG_NAME_THRESHOLD: f64 = 85.0;

/// Duration as reported by the resolver. The detector ignores it; it is only
/// carried so callers can echo it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidateDuration {
    Seconds(f64),
    Text(String),
}

/// One item of an analysis pass. Its identity is its position in the slice
/// handed to [`DuplicateDetector::detect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<CandidateDuration>,
}

impl Candidate {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            duration: None,
        }
    }
}

/// What part of a title is compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The whole normalized title.
    #[default]
    Title,
    /// Only the song name extracted from "Artist - Song" style titles.
    SongName,
}

/// Result of one analysis pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub duplicate_indices: BTreeSet<usize>,
    pub duplicate_groups: Vec<Vec<usize>>,
}

impl DuplicateReport {
    pub fn is_empty(&self) -> bool {
        self.duplicate_groups.is_empty()
    }

    /// Every grouped index except the first of its group. Dropping these
    /// keeps one copy of each song.
    pub fn redundant_indices(&self) -> BTreeSet<usize> {
        self.duplicate_groups
            .iter()
            .flat_map(|group| group.iter().skip(1).copied())
            .collect()
    }

    /// 1-based group number of `index`, as shown next to flagged rows.
    pub fn group_of(&self, index: usize) -> Option<usize> {
        self.duplicate_groups
            .iter()
            .position(|group| group.binary_search(&index).is_ok())
            .map(|position| position + 1)
    }
}

/// Invalid input rejected before any comparison work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("videos must be a list of items")]
    NotAList,
    #[error("item {index} is not an object")]
    NotAnObject { index: usize },
    #[error("item {index} is missing a title")]
    MissingTitle { index: usize },
    #[error("threshold must be a number between 0 and 100, got {0}")]
    InvalidThreshold(String),
    #[error("mode must be \"title\" or \"song_name\", got {0}")]
    InvalidMode(String),
}

/// Checks that `value` is a usable threshold on the 0–100 scale.
pub fn validate_threshold(value: f64) -> Result<f64, InputError> {
    if value.is_finite() && (0.0..=MAX_SCORE).contains(&value) {
        Ok(value)
    } else {
        Err(InputError::InvalidThreshold(value.to_string()))
    }
}

/// Wire shape of a duplicate check. `videos`, `threshold` and `mode` stay
/// loosely typed so that shape errors come back as [`InputError`]s with the
/// offending position instead of a generic deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DuplicateCheckRequest {
    #[serde(default)]
    pub videos: Value,
    #[serde(default)]
    pub threshold: Option<Value>,
    #[serde(default)]
    pub mode: Option<Value>,
}

/// A [`DuplicateCheckRequest`] that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCheck {
    pub candidates: Vec<Candidate>,
    pub threshold: Option<f64>,
    pub mode: Option<MatchMode>,
}

impl DuplicateCheckRequest {
    pub fn validate(self) -> Result<ValidatedCheck, InputError> {
        let threshold = match self.threshold {
            None | Some(Value::Null) => None,
            Some(Value::Number(number)) => {
                let value = number
                    .as_f64()
                    .ok_or_else(|| InputError::InvalidThreshold(number.to_string()))?;
                Some(validate_threshold(value)?)
            }
            Some(other) => return Err(InputError::InvalidThreshold(other.to_string())),
        };

        let mode = match self.mode {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                MatchMode::deserialize(&raw)
                    .map_err(|_| InputError::InvalidMode(raw.to_string()))?,
            ),
        };

        let items = match self.videos {
            Value::Array(items) => items,
            _ => return Err(InputError::NotAList),
        };

        let candidates = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| candidate_from_value(index, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ValidatedCheck {
            candidates,
            threshold,
            mode,
        })
    }
}

fn candidate_from_value(index: usize, item: Value) -> Result<Candidate, InputError> {
    let Value::Object(mut fields) = item else {
        return Err(InputError::NotAnObject { index });
    };

    let title = match fields.remove("title") {
        Some(Value::String(title)) => title,
        _ => return Err(InputError::MissingTitle { index }),
    };

    let duration = match fields.remove("duration") {
        Some(Value::Number(number)) => number.as_f64().map(CandidateDuration::Seconds),
        Some(Value::String(text)) => Some(CandidateDuration::Text(text)),
        _ => None,
    };

    Ok(Candidate { title, duration })
}

/// Groups candidates whose titles look like the same song.
#[derive(Debug, Clone)]
pub struct DuplicateDetector<S = TokenSetScorer> {
    normalizer: Normalizer,
    scorer: S,
    threshold: f64,
    mode: MatchMode,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl DuplicateDetector {
    /// Detector with the default noise patterns and token-set scoring.
    pub fn new(threshold: f64) -> Self {
        Self::with_scorer(Normalizer::default(), TokenSetScorer, threshold)
    }
}

impl<S: TitleScorer> DuplicateDetector<S> {
    pub fn with_scorer(normalizer: Normalizer, scorer: S, threshold: f64) -> Self {
        Self {
            normalizer,
            scorer,
            threshold,
            mode: MatchMode::Title,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// The text a title is compared by under the current mode.
    pub fn comparison_key(&self, title: &str) -> String {
        match self.mode {
            MatchMode::Title => self.normalizer.normalize(title),
            MatchMode::SongName => self.normalizer.normalize(extract_song_name(title)),
        }
    }

    /// Score of two raw titles under the current mode.
    pub fn score(&self, a: &str, b: &str) -> f64 {
        self.scorer
            .score(&self.comparison_key(a), &self.comparison_key(b))
    }

    /// Every pair `(i, j)` with `i < j` whose score reaches the threshold.
    pub fn linked_pairs<T: AsRef<str>>(&self, titles: &[T]) -> Vec<(usize, usize)> {
        let keys: Vec<String> = titles
            .iter()
            .map(|title| self.comparison_key(title.as_ref()))
            .collect();

        let mut pairs = Vec::new();
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                if self.mode == MatchMode::SongName && (keys[i].is_empty() || keys[j].is_empty())
                {
                    continue;
                }
                if self.scorer.score(&keys[i], &keys[j]) >= self.threshold {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    pub fn detect_titles<T: AsRef<str>>(&self, titles: &[T]) -> DuplicateReport {
        let pairs = self.linked_pairs(titles);
        let mut forest = DisjointSet::new(titles.len());
        for &(i, j) in &pairs {
            forest.union(i, j);
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for index in 0..titles.len() {
            components.entry(forest.find(index)).or_default().push(index);
        }

        let duplicate_groups: Vec<Vec<usize>> = components
            .into_values()
            .filter(|members| members.len() > 1)
            .collect();
        let duplicate_indices = duplicate_groups.iter().flatten().copied().collect();

        debug!(
            candidates = titles.len(),
            linked_pairs = pairs.len(),
            groups = duplicate_groups.len(),
            threshold = self.threshold,
            "duplicate detection finished"
        );

        DuplicateReport {
            duplicate_indices,
            duplicate_groups,
        }
    }

    pub fn detect(&self, candidates: &[Candidate]) -> DuplicateReport {
        let titles: Vec<&str> = candidates
            .iter()
            .map(|candidate| candidate.title.as_str())
            .collect();
        self.detect_titles(&titles)
    }
}

/// Disjoint-set forest where every root is the smallest index of its set.
#[derive(Debug)]
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            let (low, high) = (root_a.min(root_b), root_a.max(root_b));
            self.parent[high] = low;
        }
    }
}
