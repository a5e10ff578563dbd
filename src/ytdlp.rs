//! Thin wrapper around the `yt-dlp` executable.
//!
//! Link resolution and downloads shell out to yt-dlp (which in turn drives
//! ffmpeg); nothing here talks to the video host directly.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::media::{OutputFormat, VideoEntry};

/// Playlists are cut at this many entries during resolution.
pub const PLAYLIST_ITEMS: &str = "1-200";

/// Resolution keeps reading links until it holds this many entries beyond the
/// requested limit, then stops early.
const LIMIT_SLACK: usize = 50;

/// Extensions accepted when yt-dlp picked a different container than asked.
const MEDIA_EXTENSIONS: &[&str] = &["mp3", "mp4", "m4a", "webm"];

/// Anything that can fetch one entry into a directory as `<stem>.<ext>`.
/// Implemented by [`YtDlp`]; tests swap in fakes.
pub trait Downloader {
    fn download(
        &self,
        entry: &VideoEntry,
        output_dir: &Path,
        stem: &str,
        format: OutputFormat,
    ) -> Result<PathBuf>;
}

/// Player clients tried in order. A 403 moves on to the next one, any other
/// failure stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Android,
    Web,
    Default,
}

impl Strategy {
    const ORDER: [Strategy; 3] = [Strategy::Android, Strategy::Web, Strategy::Default];

    fn label(self) -> &'static str {
        match self {
            Strategy::Android => "android client",
            Strategy::Web => "web client",
            Strategy::Default => "default",
        }
    }

    fn extractor_args(self) -> Option<&'static str> {
        match self {
            Strategy::Android => Some("youtube:player_client=android"),
            Strategy::Web => Some("youtube:player_client=web"),
            Strategy::Default => None,
        }
    }
}

/// Entries gathered from a batch of links plus one message per link that
/// produced nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resolution {
    pub videos: Vec<VideoEntry>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ffmpeg_location: None,
        }
    }

    pub fn with_ffmpeg_location(mut self, location: Option<PathBuf>) -> Self {
        self.ffmpeg_location = location;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Fails loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<()> {
        ensure_program_available(&self.program)
    }

    /// Fails when no ffmpeg can be found, either at the configured location
    /// or on `PATH`.
    pub fn ensure_ffmpeg(&self) -> Result<()> {
        match &self.ffmpeg_location {
            Some(location) if location.is_dir() => {
                ensure_program_available(&location.join("ffmpeg"))
            }
            Some(location) => ensure_program_available(location),
            None => ensure_program_available(Path::new("ffmpeg")),
        }
    }

    /// Lists the entries behind one link. Playlists are flattened; a single
    /// video yields one entry carrying the link it was resolved from.
    pub fn extract_entries(&self, url: &str) -> Result<Vec<VideoEntry>> {
        let mut command = Command::new(&self.program);
        command
            .arg("--dump-single-json")
            .arg("--flat-playlist")
            .arg("--skip-download")
            .arg("--ignore-errors")
            .arg("--no-warnings")
            .arg("--socket-timeout")
            .arg("5")
            .arg("--retries")
            .arg("1")
            .arg("--no-check-certificates")
            .arg("--geo-bypass")
            .arg("--playlist-items")
            .arg(PLAYLIST_ITEMS)
            .arg("--")
            .arg(url);

        let output = command
            .output()
            .with_context(|| format!("running {} for {}", self.program.display(), url))?;

        if !output.status.success() {
            bail!(
                "metadata command failed for {} (status {}): {}",
                url,
                output.status,
                last_line(&output.stderr)
            );
        }

        let raw = String::from_utf8(output.stdout).context("parsing metadata JSON as UTF-8")?;
        parse_info_json(&raw, url)
    }

    /// Resolves every link in order, collecting per-link failures instead of
    /// aborting. With a `limit`, stops once comfortably past it and truncates
    /// the result to exactly `limit` entries.
    pub fn resolve_all(&self, urls: &[String], limit: Option<usize>) -> Resolution {
        let mut resolution = Resolution::default();

        for url in urls.iter().map(|url| url.trim()).filter(|url| !url.is_empty()) {
            match self.extract_entries(url) {
                Ok(entries) if entries.is_empty() => {
                    resolution
                        .errors
                        .push(format!("Could not extract info from: {url}"));
                }
                Ok(entries) => {
                    info!(url, count = entries.len(), "resolved link");
                    resolution.videos.extend(entries);
                    if let Some(limit) = limit
                        && resolution.videos.len() > limit + LIMIT_SLACK
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(url, error = %err, "failed to resolve link");
                    resolution
                        .errors
                        .push(format!("Error processing {url}: {err:#}"));
                }
            }
        }

        if let Some(limit) = limit {
            resolution.videos.truncate(limit);
        }
        resolution.videos = resolution
            .videos
            .into_iter()
            .map(VideoEntry::with_formatted_duration)
            .collect();
        resolution
    }

    fn download_command(
        &self,
        entry: &VideoEntry,
        template: &Path,
        format: OutputFormat,
        strategy: Strategy,
    ) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(format.ytdlp_args())
            .arg("--output")
            .arg(template)
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--retries")
            .arg("1")
            .arg("--fragment-retries")
            .arg("1")
            .arg("--socket-timeout")
            .arg("8")
            .arg("--concurrent-fragments")
            .arg("8")
            .arg("--no-check-certificates")
            .arg("--geo-bypass")
            .arg("--postprocessor-args")
            .arg("ffmpeg:-threads 0");

        if let Some(location) = &self.ffmpeg_location {
            command.arg("--ffmpeg-location").arg(location);
        }
        if let Some(extractor_args) = strategy.extractor_args() {
            command.arg("--extractor-args").arg(extractor_args);
        }

        command
            .arg("--")
            .arg(&entry.url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

impl Downloader for YtDlp {
    /// Downloads `entry` into `output_dir` as `<stem>.<ext>`, walking through
    /// the player-client strategies on 403 errors.
    fn download(
        &self,
        entry: &VideoEntry,
        output_dir: &Path,
        stem: &str,
        format: OutputFormat,
    ) -> Result<PathBuf> {
        if entry.url.trim().is_empty() {
            bail!("No URL");
        }

        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;

        let template = output_dir.join(format!("{stem}.%(ext)s"));
        let expected = output_dir.join(format!("{stem}.{}", format.extension()));
        let mut last_error = None;

        for strategy in Strategy::ORDER {
            debug!(title = %entry.title, strategy = strategy.label(), "trying download");
            let output = self
                .download_command(entry, &template, format, strategy)
                .output()
                .with_context(|| format!("running {}", self.program.display()))?;

            if output.status.success() {
                if let Some(path) = find_download(output_dir, stem, &expected)? {
                    info!(path = %path.display(), "downloaded");
                    return Ok(path);
                }
                last_error = Some(anyhow!(
                    "{} finished without writing {stem}.*",
                    strategy.label()
                ));
                continue;
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = last_line(&output.stderr);
            warn!(title = %entry.title, strategy = strategy.label(), error = %message, "download attempt failed");
            last_error = Some(anyhow!("{} failed: {}", strategy.label(), message));
            if !stderr.contains("403") {
                break;
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("all download strategies failed"))
            .context(format!("downloading {}", entry.title)))
    }
}

/// Runs `<program> --version` to fail loudly when a dependency is missing.
pub fn ensure_program_available(program: &Path) -> Result<()> {
    let status = Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {}",
            program.display(),
            err
        ),
    }
}

/// Only the fields we read from `--dump-single-json`.
#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Option<Vec<RawThumbnail>>,
    #[serde(default)]
    entries: Option<Vec<Option<RawInfo>>>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    #[serde(default)]
    url: Option<String>,
}

impl RawInfo {
    fn into_entry(self, fallback_url: Option<&str>) -> VideoEntry {
        let id = self.id.unwrap_or_default();
        let url = match fallback_url {
            Some(url) => url.to_string(),
            None => self
                .url
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}")),
        };
        let thumbnail = self.thumbnail.filter(|t| !t.is_empty()).or_else(|| {
            self.thumbnails
                .unwrap_or_default()
                .into_iter()
                .rev()
                .find_map(|thumb| thumb.url)
        });

        VideoEntry {
            id,
            title: self
                .title
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            url,
            duration: self.duration,
            duration_formatted: None,
            thumbnail,
        }
    }
}

/// Parses yt-dlp's JSON dump. Playlists map entry by entry (skipping null
/// entries yt-dlp emits for unavailable items); a single video keeps
/// `requested_url`.
pub fn parse_info_json(raw: &str, requested_url: &str) -> Result<Vec<VideoEntry>> {
    let mut info: RawInfo = serde_json::from_str(raw).context("deserializing metadata JSON")?;

    match info.entries.take() {
        Some(entries) => Ok(entries
            .into_iter()
            .flatten()
            .map(|entry| entry.into_entry(None))
            .collect()),
        None => Ok(vec![info.into_entry(Some(requested_url))]),
    }
}

fn find_download(dir: &Path, stem: &str, expected: &Path) -> Result<Option<PathBuf>> {
    if expected.exists() {
        return Ok(Some(expected.to_path_buf()));
    }

    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let matches_stem = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
        let media_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if matches_stem && media_ext {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("no output")
        .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// Writes an executable shell script standing in for yt-dlp.
    pub(crate) fn install_stub(dir: &Path, body: &str) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = format!("#!/usr/bin/env bash\nset -euo pipefail\n{body}\n");
        fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms)?;
        }
        Ok(script_path)
    }

    /// Stub body that writes `<output template with ext=mp3>` and succeeds,
    /// except for the android client which gets a 403.
    pub(crate) const FORBIDDEN_ON_ANDROID: &str = r#"
prev=""
output=""
for arg in "$@"; do
    if [[ "$prev" == "--output" ]]; then
        output="$arg"
    fi
    prev="$arg"
done
echo "$*" >> "$(dirname "$0")/calls.log"
if [[ " $* " == *"player_client=android"* ]]; then
    echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
    exit 1
fi
target=$(printf '%s' "$output" | sed 's/%(ext)s/mp3/')
printf 'audio' > "$target"
"#;

    fn entry(title: &str) -> VideoEntry {
        VideoEntry {
            id: "abc".into(),
            title: title.into(),
            url: "https://www.youtube.com/watch?v=abc".into(),
            duration: Some(200.0),
            duration_formatted: None,
            thumbnail: None,
        }
    }

    #[test]
    fn parse_playlist_json_skips_null_entries() -> Result<()> {
        let raw = json!({
            "id": "PL1",
            "title": "Mix",
            "entries": [
                { "id": "a1", "title": "First", "url": "https://www.youtube.com/watch?v=a1", "duration": 61 },
                null,
                { "id": "b2", "title": "", "duration": null,
                  "thumbnails": [{ "url": "https://i/1.jpg" }, { "url": "https://i/2.jpg" }] }
            ]
        })
        .to_string();

        let entries = parse_info_json(&raw, "https://www.youtube.com/playlist?list=PL1")?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "First");
        assert_eq!(entries[0].duration, Some(61.0));
        assert_eq!(entries[1].title, "Unknown");
        assert_eq!(entries[1].url, "https://www.youtube.com/watch?v=b2");
        assert_eq!(entries[1].thumbnail.as_deref(), Some("https://i/2.jpg"));
        Ok(())
    }

    #[test]
    fn parse_single_video_keeps_requested_url() -> Result<()> {
        let raw = json!({
            "id": "xyz",
            "title": "Imagine Dragons - Believer",
            "duration": 204.0,
            "thumbnail": "https://i/xyz.jpg",
            "url": "https://rr1---sn.googlevideo.com/stream"
        })
        .to_string();

        let entries = parse_info_json(&raw, "https://youtu.be/xyz")?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://youtu.be/xyz");
        assert_eq!(entries[0].thumbnail.as_deref(), Some("https://i/xyz.jpg"));
        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_info_json("not json", "u").is_err());
    }

    #[test]
    fn download_without_url_fails_fast() {
        let dir = tempdir().unwrap();
        let mut item = entry("Song");
        item.url.clear();
        let err = YtDlp::new(dir.path().join("missing"))
            .download(&item, dir.path(), "Song", OutputFormat::Mp3)
            .unwrap_err();
        assert_eq!(err.to_string(), "No URL");
    }

    #[cfg(unix)]
    #[test]
    fn extract_entries_runs_the_program() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(
            dir.path(),
            r#"cat <<'JSON'
{"id":"PL","entries":[{"id":"a","title":"A","duration":30},{"id":"b","title":"B"}]}
JSON"#,
        )?;
        let ytdlp = YtDlp::new(stub);
        let entries = ytdlp.extract_entries("https://www.youtube.com/playlist?list=PL")?;
        assert_eq!(
            entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn resolve_all_collects_errors_and_applies_limit() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(
            dir.path(),
            r#"url="${@: -1}"
case "$url" in
  *broken*) echo "ERROR: Unsupported URL" >&2; exit 1 ;;
  *empty*) echo '{"id":"E","entries":[]}' ;;
  *) echo '{"id":"PL","entries":[{"id":"a","title":"A","duration":65},{"id":"b","title":"B"},{"id":"c","title":"C"}]}' ;;
esac"#,
        )?;
        let ytdlp = YtDlp::new(stub);
        let urls = vec![
            "https://example.com/broken".to_string(),
            "   ".to_string(),
            "https://example.com/empty".to_string(),
            "https://example.com/list".to_string(),
        ];

        let resolution = ytdlp.resolve_all(&urls, Some(2));
        assert_eq!(resolution.videos.len(), 2);
        assert_eq!(resolution.videos[0].duration_formatted.as_deref(), Some("1:05"));
        assert_eq!(resolution.videos[1].duration_formatted.as_deref(), Some("Unknown"));
        assert_eq!(resolution.errors.len(), 2);
        assert!(resolution.errors[0].starts_with("Error processing https://example.com/broken"));
        assert_eq!(
            resolution.errors[1],
            "Could not extract info from: https://example.com/empty"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn download_falls_back_after_forbidden() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), FORBIDDEN_ON_ANDROID)?;
        let out = dir.path().join("out");

        let path = YtDlp::new(stub).download(
            &entry("Believer (Live)"),
            &out,
            "Believer (Live)",
            OutputFormat::Mp3,
        )?;
        assert_eq!(path, out.join("Believer (Live).mp3"));
        assert_eq!(fs::read_to_string(&path)?, "audio");

        let calls = fs::read_to_string(dir.path().join("calls.log"))?;
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("player_client=android"));
        assert!(calls[1].contains("player_client=web"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn download_stops_on_other_errors() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(
            dir.path(),
            r#"echo "call" >> "$(dirname "$0")/calls.log"
echo "ERROR: Video unavailable" >&2
exit 1"#,
        )?;

        let err = YtDlp::new(stub)
            .download(&entry("Song"), dir.path(), "Song", OutputFormat::M4a)
            .unwrap_err();
        assert!(format!("{err:#}").contains("Video unavailable"));
        let calls = fs::read_to_string(dir.path().join("calls.log"))?;
        assert_eq!(calls.lines().count(), 1);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn ensure_available_reports_missing_programs() -> Result<()> {
        let dir = tempdir()?;
        assert!(YtDlp::new(dir.path().join("nope")).ensure_available().is_err());
        let stub = install_stub(dir.path(), "exit 0")?;
        YtDlp::new(stub).ensure_available()?;
        Ok(())
    }
}
