//! Media items as they travel between the resolver, the duplicate check and
//! the downloader.
//!
//! These structs are what the HTTP API and the CLI serialize, so field names
//! follow the JSON the frontend already speaks (`duration_formatted`,
//! `successful_count`, ...). Optional fields are skipped when empty to keep
//! payloads small for long playlists.

use std::{collections::HashSet, fmt, str::FromStr};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::detector::{Candidate, CandidateDuration};

/// A single resolved video, either a standalone link or one playlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEntry {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Length in seconds as reported by yt-dlp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// `M:SS` / `H:MM:SS`, or `Unknown` when yt-dlp had no duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_formatted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl VideoEntry {
    /// The view of this entry the duplicate detector works on.
    pub fn to_candidate(&self) -> Candidate {
        Candidate {
            title: self.title.clone(),
            duration: self.duration.map(CandidateDuration::Seconds),
        }
    }

    /// Fills `duration_formatted` from `duration`.
    pub fn with_formatted_duration(mut self) -> Self {
        self.duration_formatted = Some(format_duration(self.duration));
        self
    }
}

/// Target container/codec of a download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    #[serde(rename = "mp3")]
    Mp3,
    /// Up to 720p video.
    #[serde(rename = "mp4")]
    Mp4,
    /// Up to 1080p video.
    #[serde(rename = "mp4_1080")]
    Mp4Hd,
    #[serde(rename = "m4a")]
    M4a,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Mp3,
        OutputFormat::Mp4,
        OutputFormat::Mp4Hd,
        OutputFormat::M4a,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mp4Hd => "mp4_1080",
            OutputFormat::M4a => "m4a",
        }
    }

    /// File extension of the final artifact.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Mp4 | OutputFormat::Mp4Hd => "mp4",
            OutputFormat::M4a => "m4a",
        }
    }

    /// yt-dlp format selection and post-processing flags.
    pub fn ytdlp_args(self) -> Vec<&'static str> {
        match self {
            OutputFormat::Mp3 => vec![
                "--format",
                "bestaudio/best",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
            ],
            OutputFormat::M4a => vec![
                "--format",
                "bestaudio[ext=m4a]/bestaudio/best",
                "--extract-audio",
                "--audio-format",
                "m4a",
                "--audio-quality",
                "256K",
            ],
            OutputFormat::Mp4 => vec![
                "--format",
                "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]/best",
                "--merge-output-format",
                "mp4",
            ],
            OutputFormat::Mp4Hd => vec![
                "--format",
                "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/best",
                "--merge-output-format",
                "mp4",
            ],
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let wanted = value.trim().to_ascii_lowercase();
        match OutputFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == wanted)
        {
            Some(format) => Ok(format),
            None => bail!("unknown output format {value:?} (expected mp3, mp4, mp4_1080 or m4a)"),
        }
    }
}

/// Result of downloading one entry. Failed outcomes keep the entry so the
/// item can be resubmitted as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub title: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub video: VideoEntry,
}

impl DownloadOutcome {
    pub fn succeeded(video: &VideoEntry, filename: impl Into<String>) -> Self {
        Self {
            title: video.title.clone(),
            success: true,
            filename: Some(filename.into()),
            error: None,
            video: video.clone(),
        }
    }

    pub fn failed(video: &VideoEntry, error: impl Into<String>) -> Self {
        Self {
            title: video.title.clone(),
            success: false,
            filename: None,
            error: Some(error.into()),
            video: video.clone(),
        }
    }
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips, `Unknown` when
/// missing or zero.
pub fn format_duration(seconds: Option<f64>) -> String {
    let total = match seconds {
        Some(value) if value.is_finite() && value >= 1.0 => value as i64,
        _ => return "Unknown".to_string(),
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// Turns a title into a file stem: keeps letters, digits, spaces and
/// `-_()`, falls back to the video id (or `download`) when nothing is left.
pub fn sanitize_title(title: &str, fallback_id: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '(' | ')'))
        .collect();
    let cleaned = cleaned.trim();
    if !cleaned.is_empty() {
        return cleaned.to_string();
    }
    let fallback = sanitize_id(fallback_id);
    if fallback.is_empty() {
        "download".to_string()
    } else {
        fallback
    }
}

/// File stems for a batch, one per entry. Entries whose sanitized titles
/// collide get their id appended (or a counter when that collides too), so no
/// two entries share an output file.
pub fn unique_stems<'a>(entries: impl IntoIterator<Item = &'a VideoEntry>) -> Vec<String> {
    let mut used = HashSet::new();
    entries
        .into_iter()
        .map(|entry| {
            let base = sanitize_title(&entry.title, &entry.id);
            if used.insert(base.clone()) {
                return base;
            }
            let id = sanitize_id(&entry.id);
            let mut stem = if id.is_empty() {
                base.clone()
            } else {
                format!("{base} ({id})")
            };
            let mut counter = 2;
            while !used.insert(stem.clone()) {
                stem = format!("{base} ({counter})");
                counter += 1;
            }
            stem
        })
        .collect()
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect()
}
