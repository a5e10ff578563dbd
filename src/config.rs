use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    detector::{DEFAULT_THRESHOLD, DuplicateDetector, MatchMode, validate_threshold},
    normalize::Normalizer,
    session::DEFAULT_PARALLEL_DOWNLOADS,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/songgrab-env";
pub const DEFAULT_SONGGRAB_PORT: u16 = 5000;
pub const DEFAULT_SONGGRAB_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub download_root: Option<PathBuf>,
    pub songgrab_host: Option<String>,
    pub songgrab_port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_location: Option<PathBuf>,
    pub detector_config: Option<PathBuf>,
    pub max_parallel_downloads: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_root: PathBuf,
    pub songgrab_host: String,
    pub songgrab_port: u16,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_location: Option<PathBuf>,
    pub detector_config: Option<PathBuf>,
    pub max_parallel_downloads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::from(EnvConfig::default())
    }
}

impl From<EnvConfig> for RuntimeConfig {
    fn from(cfg: EnvConfig) -> Self {
        RuntimeConfig {
            download_root: cfg
                .download_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_ROOT)),
            songgrab_host: cfg
                .songgrab_host
                .unwrap_or_else(|| DEFAULT_SONGGRAB_HOST.to_string()),
            songgrab_port: cfg.songgrab_port.unwrap_or(DEFAULT_SONGGRAB_PORT),
            ytdlp_path: cfg
                .ytdlp_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PATH)),
            ffmpeg_location: cfg.ffmpeg_location,
            detector_config: cfg.detector_config,
            max_parallel_downloads: cfg
                .max_parallel_downloads
                .unwrap_or(DEFAULT_PARALLEL_DOWNLOADS),
        }
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "DOWNLOAD_ROOT" => cfg.download_root = Some(PathBuf::from(value)),
                "SONGGRAB_HOST" => cfg.songgrab_host = Some(value.to_string()),
                "SONGGRAB_PORT" => {
                    let port: u16 = value.parse().with_context(|| {
                        format!("Parsing SONGGRAB_PORT from {}", path.display())
                    })?;
                    cfg.songgrab_port = Some(port);
                }
                "YTDLP_PATH" => cfg.ytdlp_path = Some(PathBuf::from(value)),
                "FFMPEG_LOCATION" => cfg.ffmpeg_location = Some(PathBuf::from(value)),
                "DETECTOR_CONFIG" => cfg.detector_config = Some(PathBuf::from(value)),
                "MAX_PARALLEL_DOWNLOADS" => {
                    let workers: usize = value.parse().with_context(|| {
                        format!("Parsing MAX_PARALLEL_DOWNLOADS from {}", path.display())
                    })?;
                    cfg.max_parallel_downloads = Some(workers.max(1));
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// Reads the env file at `path`; a missing file yields the defaults.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    Ok(RuntimeConfig::from(cfg))
}

/// Tuning for the duplicate detector, read from a TOML file.
///
/// ```toml
/// threshold = 85
/// mode = "song_name"
/// extra_noise_patterns = ['\(demo\)']
/// ```
///
/// `noise_patterns` replaces the built-in list; `extra_noise_patterns` is
/// appended after whichever list is in effect.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorSettings {
    pub threshold: Option<f64>,
    pub mode: Option<MatchMode>,
    pub noise_patterns: Option<Vec<String>>,
    pub extra_noise_patterns: Vec<String>,
}

impl DetectorSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Parsing detector settings")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Loading {}", path.display()))
    }

    /// Loads the file when one is configured, otherwise the defaults.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn build(&self) -> Result<DuplicateDetector> {
        let threshold = validate_threshold(self.threshold.unwrap_or(DEFAULT_THRESHOLD))?;
        let normalizer = match &self.noise_patterns {
            Some(patterns) => {
                Normalizer::with_patterns(patterns).context("Compiling noise_patterns")?
            }
            None => Normalizer::default(),
        };
        let normalizer = normalizer
            .extend(&self.extra_noise_patterns)
            .context("Compiling extra_noise_patterns")?;

        Ok(DuplicateDetector::new(threshold)
            .with_normalizer(normalizer)
            .with_mode(self.mode.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_port() {
        let cfg = make_config("DOWNLOAD_ROOT=\"/songs\"\nSONGGRAB_PORT=\"4242\"\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.songgrab_port, Some(4242));
        assert_eq!(parsed.download_root, Some(PathBuf::from("/songs")));
    }

    #[test]
    fn read_env_config_rejects_bad_port() {
        let cfg = make_config("SONGGRAB_PORT=\"eighty\"\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("SONGGRAB_PORT"));
    }

    #[test]
    fn load_runtime_config_defaults_missing_values() {
        let cfg = make_config("# comment\n\nYTDLP_PATH=\"/opt/yt-dlp\"\n");
        let runtime = load_runtime_config_from(cfg.path()).unwrap();
        assert_eq!(runtime.songgrab_port, DEFAULT_SONGGRAB_PORT);
        assert_eq!(runtime.songgrab_host, DEFAULT_SONGGRAB_HOST);
        assert_eq!(runtime.download_root, PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
        assert_eq!(runtime.ytdlp_path, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(runtime.max_parallel_downloads, DEFAULT_PARALLEL_DOWNLOADS);
        assert!(runtime.ffmpeg_location.is_none());
    }

    #[test]
    fn load_runtime_config_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = load_runtime_config_from(dir.path().join("absent")).unwrap();
        assert_eq!(runtime.songgrab_port, DEFAULT_SONGGRAB_PORT);
    }

    #[test]
    fn load_runtime_config_reads_host_and_workers() {
        let cfg = make_config(
            "SONGGRAB_HOST=\"0.0.0.0\"\nMAX_PARALLEL_DOWNLOADS=\"0\"\nFFMPEG_LOCATION=\"/usr/bin\"\n",
        );
        let runtime = load_runtime_config_from(cfg.path()).unwrap();
        assert_eq!(runtime.songgrab_host, "0.0.0.0");
        assert_eq!(runtime.max_parallel_downloads, 1);
        assert_eq!(runtime.ffmpeg_location, Some(PathBuf::from("/usr/bin")));
    }

    #[test]
    fn detector_settings_default_to_builtin_detector() {
        let detector = DetectorSettings::default().build().unwrap();
        assert_eq!(detector.threshold(), DEFAULT_THRESHOLD);
        assert_eq!(detector.mode(), MatchMode::Title);
    }

    #[test]
    fn detector_settings_parse_toml() {
        let settings = DetectorSettings::from_toml_str(
            "threshold = 85\nmode = \"song_name\"\nextra_noise_patterns = ['\\(demo\\)']\n",
        )
        .unwrap();
        assert_eq!(settings.threshold, Some(85.0));
        assert_eq!(settings.mode, Some(MatchMode::SongName));

        let detector = settings.build().unwrap();
        assert_eq!(detector.mode(), MatchMode::SongName);
        assert_eq!(detector.normalizer().normalize("Song (Demo) [Lyrics]"), "song");
    }

    #[test]
    fn detector_settings_replace_patterns() {
        let settings = DetectorSettings {
            noise_patterns: Some(vec![r"\(demo\)".to_string()]),
            ..DetectorSettings::default()
        };
        let detector = settings.build().unwrap();
        assert_eq!(detector.normalizer().pattern_count(), 1);
        assert_eq!(detector.normalizer().normalize("Song (Demo) [Lyrics]"), "song [lyrics]");
    }

    #[test]
    fn detector_settings_reject_bad_values() {
        assert!(DetectorSettings::from_toml_str("threshold = 85\nunknown = 1\n").is_err());
        let out_of_range = DetectorSettings {
            threshold: Some(150.0),
            ..DetectorSettings::default()
        };
        assert!(out_of_range.build().is_err());
        let bad_regex = DetectorSettings {
            extra_noise_patterns: vec!["(".to_string()],
            ..DetectorSettings::default()
        };
        assert!(bad_regex.build().is_err());
    }

    #[test]
    fn detector_settings_load_from_file() {
        let file = make_config("threshold = 70.5\n");
        let settings = DetectorSettings::load_optional(Some(file.path())).unwrap();
        assert_eq!(settings.threshold, Some(70.5));
        assert_eq!(
            DetectorSettings::load_optional(None).unwrap(),
            DetectorSettings::default()
        );
    }
}
