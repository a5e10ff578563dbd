//! Title normalization applied before similarity scoring.
//!
//! Video titles carry a lot of edition noise ("(Official Video)", "[Lyrics]",
//! featuring credits, resolution tags...) that says nothing about which song
//! the upload contains. [`Normalizer`] lowercases a title, strips a
//! configurable list of such patterns, removes brackets left empty, collapses
//! whitespace and trims separator punctuation from both ends.
//!
//! The pipeline is repeated until the text stops changing, so stripping one
//! pattern can never expose another match that a second call would remove:
//! `normalize(normalize(s)) == normalize(s)` holds for every input.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

/// Patterns stripped by default. Each entry is a regular expression matched
/// case-insensitively. Bracketed forms come before bare words so that
/// "(Official Video)" does not leave a stray "()" behind.
pub const DEFAULT_NOISE_PATTERNS: &[&str] = &[
    r"[\(\[]\s*official\s*(music\s*)?video\s*[\)\]]",
    r"[\(\[]\s*official\s*(audio|visuali[sz]er)\s*[\)\]]",
    r"[\(\[]\s*lyrics?(\s*video)?\s*[\)\]]",
    r"[\(\[]\s*(mv|m/v|audio|hd|hq|4k)\s*[\)\]]",
    r"[\(\[]\s*remaster(ed)?(\s*\d{4})?\s*[\)\]]",
    r"[\(\[]\s*(feat|ft)\.?\s[^\)\]]*[\)\]]",
    r"\b(feat|ft)\.?\s+[^\(\)\[\]\|\-]+",
    r"\bprod\.?\s+[^\(\)\[\]\|\-]+",
    r"\bofficial\s*(music\s*)?video\b",
    r"\bofficial\s*audio\b",
    r"\blyrics?\s*video\b",
    r"\|.*$",
    r"\b\d{4}\s*(mv|music\s*video)\b",
    r"\b(hd|4k|1080p|720p)\b",
    r"【.*?】",
    r"动态歌词|動態歌詞",
    r"歌词版?|歌詞版?",
    r"完整版",
    r"高清版?",
    r"高音質|高音质",
    r"無損|无损",
    r"拼音",
    r"中文字幕",
    r"附詞|附词",
    r"純音樂|纯音乐",
    r"伴奏",
    r"翻唱",
    r"現場|现场",
    r"演唱會|演唱会",
    r"\blyrics?\b",
    r"\bpinyin\b",
    r"\bviet\s*sub\b",
    r"\bcover\b",
    r"\blive\b",
];

static DEFAULT_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_patterns(DEFAULT_NOISE_PATTERNS).expect("default noise patterns must compile")
});

static EMPTY_BRACKETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*\)|\[\s*\]").expect("empty bracket regex"));

static SONG_NAME_BRACKETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[《「【](.+?)[》」】]").expect("song name bracket regex"));

/// Separators between artist and song name, tried in order.
const SONG_NAME_SEPARATORS: &[&str] = &[" - ", " | ", " – ", "：", ": "];

/// Lowercases and strips noise from titles.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: Vec<Regex>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }
}

impl Normalizer {
    /// Builds a normalizer from an explicit pattern list, replacing the
    /// defaults entirely.
    pub fn with_patterns<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            rules: compile_patterns(patterns)?,
        })
    }

    /// Appends more patterns after the current ones.
    pub fn extend<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules.extend(compile_patterns(patterns)?);
        Ok(self)
    }

    pub fn pattern_count(&self) -> usize {
        self.rules.len()
    }

    pub fn normalize(&self, title: &str) -> String {
        let mut current = title.to_lowercase();
        loop {
            let next = self.strip_once(&current);
            if next == current {
                return next;
            }
            current = next;
        }
    }

    fn strip_once(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for rule in &self.rules {
            let replaced = rule.replace_all(&out, "");
            if replaced != out.as_str() {
                out = replaced.into_owned();
            }
        }
        let out = EMPTY_BRACKETS.replace_all(&out, "");
        let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim_matches(is_edge_char).to_owned()
    }
}

fn is_edge_char(c: char) -> bool {
    c.is_whitespace() || matches!(c, '-' | '–' | '|' | ':')
}

fn compile_patterns<I, S>(patterns: I) -> Result<Vec<Regex>, regex::Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| {
            RegexBuilder::new(pattern.as_ref())
                .case_insensitive(true)
                .build()
        })
        .collect()
}

/// Pulls the song name out of an "Artist - Song" style title.
///
/// Text inside `《》`, `「」` or `【】` wins; otherwise the part after the
/// first known separator is returned. Titles without either come back as-is.
pub fn extract_song_name(title: &str) -> &str {
    if let Some(inner) = SONG_NAME_BRACKETS
        .captures(title)
        .and_then(|caps| caps.get(1))
    {
        return inner.as_str().trim();
    }

    for separator in SONG_NAME_SEPARATORS {
        if let Some((_, song)) = title.split_once(separator) {
            return song.trim();
        }
    }

    title
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(title: &str) -> String {
        Normalizer::default().normalize(title)
    }

    #[test]
    fn default_patterns_compile() {
        assert_eq!(
            Normalizer::default().pattern_count(),
            DEFAULT_NOISE_PATTERNS.len()
        );
    }

    #[test]
    fn strips_edition_tags() {
        assert_eq!(
            norm("Imagine Dragons - Believer (Official Video)"),
            "imagine dragons - believer"
        );
        assert_eq!(norm("Song [Lyrics]"), "song");
        assert_eq!(norm("Song (Remastered 2011)"), "song");
        assert_eq!(norm("Artist - Song (Official Music Video) [HD]"), "artist - song");
        assert_eq!(norm("Believer 2017 MV"), "believer");
    }

    #[test]
    fn strips_featuring_credits() {
        assert_eq!(norm("Artist - Song (feat. Someone Else)"), "artist - song");
        assert_eq!(norm("Artist - Song ft. Someone"), "artist - song");
    }

    #[test]
    fn drops_trailing_pipe_segment_and_separators() {
        assert_eq!(norm("  Song   |  Label Records"), "song");
        assert_eq!(norm("LIVE: Song"), "song");
    }

    #[test]
    fn bare_words_need_word_boundaries() {
        assert_eq!(norm("Oliver Tree - Life Goes On"), "oliver tree - life goes on");
    }

    #[test]
    fn strips_chinese_edition_words() {
        assert_eq!(norm("周杰倫 Jay Chou【晴天 Sunny Day】動態歌詞"), "周杰倫 jay chou");
    }

    #[test]
    fn placeholders_survive() {
        assert_eq!(norm("[Private video]"), "[private video]");
        assert_eq!(norm(""), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "a (off(official video)icial video)",
            "Imagine Dragons - Believer (Official Video)",
            "  --  Song\t\t(Live)  ||  ",
            "Artist - Song (feat. X) [Lyrics] | Records",
            "周杰倫《晴天》高音質 無損",
            "((()))",
            "[Deleted video]",
            "ÀÉÎ ÕÜ - ß",
        ];
        let normalizer = Normalizer::default();
        for sample in samples {
            let once = normalizer.normalize(sample);
            assert_eq!(normalizer.normalize(&once), once, "input {sample:?}");
        }
    }

    #[test]
    fn nested_matches_are_removed_completely() {
        assert_eq!(norm("a (off(official video)icial video)"), "a");
    }

    #[test]
    fn custom_patterns_replace_defaults() -> Result<(), regex::Error> {
        let normalizer = Normalizer::with_patterns([r"\(demo\)"])?;
        assert_eq!(normalizer.normalize("Song (Demo) (Official Video)"), "song (official video)");
        Ok(())
    }

    #[test]
    fn extra_patterns_extend_defaults() -> Result<(), regex::Error> {
        let normalizer = Normalizer::default().extend([r"\(demo\)"])?;
        assert_eq!(normalizer.normalize("Song (Demo) (Official Video)"), "song");
        Ok(())
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(Normalizer::with_patterns(["(unclosed"]).is_err());
    }

    #[test]
    fn extract_song_name_prefers_brackets() {
        assert_eq!(extract_song_name("周杰倫《晴天》MV"), "晴天");
        assert_eq!(extract_song_name("Artist「Song」"), "Song");
    }

    #[test]
    fn extract_song_name_uses_separators() {
        assert_eq!(extract_song_name("Imagine Dragons - Believer"), "Believer");
        assert_eq!(extract_song_name("Artist | Song | Extra"), "Song | Extra");
        assert_eq!(extract_song_name("Artist: Song"), "Song");
        assert_eq!(extract_song_name("Just A Song"), "Just A Song");
    }
}
