//! Command-line front end: resolve links, flag duplicate songs and download
//! a batch into a local directory.
//!
//! `grab dupes` works offline on a JSON list of titles; `fetch` and `download`
//! need yt-dlp (and ffmpeg for audio extraction).

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use songgrab_tools::{
    config::{self, DetectorSettings, RuntimeConfig},
    detector::{
        DuplicateCheckRequest, DuplicateDetector, DuplicateReport, MatchMode, SONG_NAME_THRESHOLD,
        validate_threshold,
    },
    logging,
    media::{OutputFormat, VideoEntry},
    packaging::{self, ARCHIVE_NAME},
    session::{self, DownloadSession},
    ytdlp::YtDlp,
};
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve, de-duplicate and download songs.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = config::DEFAULT_CONFIG_PATH, help = "Path to the env config file")]
    config: PathBuf,
    #[arg(
        long = "detector-config",
        value_name = "PATH",
        help = "TOML file with detector settings"
    )]
    detector_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report duplicate groups in a JSON list of items (`-` reads stdin)
    Dupes {
        input: PathBuf,
        #[command(flatten)]
        detection: DetectionArgs,
        #[arg(long, help = "Print the raw JSON report")]
        json: bool,
    },
    /// Resolve links and list the entries behind them
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(long, help = "Keep at most this many entries")]
        limit: Option<usize>,
        #[command(flatten)]
        detection: DetectionArgs,
    },
    /// Resolve links and download every entry
    Download {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(short = 'f', long, default_value_t = OutputFormat::Mp3, help = "mp3, mp4, mp4_1080 or m4a")]
        format: OutputFormat,
        #[arg(short = 'o', long = "out", value_name = "DIR", help = "Target directory")]
        out: Option<PathBuf>,
        #[arg(long, help = "Keep at most this many entries")]
        limit: Option<usize>,
        #[arg(long, help = "Download only the first entry of each duplicate group")]
        skip_duplicates: bool,
        #[arg(long, help = "Bundle the downloaded files into a tar.gz")]
        archive: bool,
        #[arg(long, value_name = "N", help = "Parallel downloads")]
        workers: Option<usize>,
        #[command(flatten)]
        detection: DetectionArgs,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct DetectionArgs {
    #[arg(long, value_name = "0-100", help = "Similarity threshold")]
    threshold: Option<f64>,
    #[arg(long, help = "Compare extracted song names instead of full titles")]
    song_name: bool,
}

impl DetectionArgs {
    /// Applies the flags on top of the configured detector. `--song-name`
    /// without `--threshold` uses the stricter song-name default.
    fn apply(self, detector: DuplicateDetector) -> Result<DuplicateDetector> {
        let mut detector = detector;
        if self.song_name {
            detector = detector
                .with_mode(MatchMode::SongName)
                .with_threshold(SONG_NAME_THRESHOLD);
        }
        if let Some(threshold) = self.threshold {
            detector = detector.with_threshold(validate_threshold(threshold)?);
        }
        Ok(detector)
    }
}

fn main() -> Result<()> {
    logging::init_with_default("warn");
    let cli = Cli::parse();

    let runtime = config::load_runtime_config_from(&cli.config)?;
    let detector_path = cli
        .detector_config
        .clone()
        .or_else(|| runtime.detector_config.clone());
    let detector = DetectorSettings::load_optional(detector_path.as_deref())?.build()?;

    match cli.command {
        Command::Dupes {
            input,
            detection,
            json,
        } => run_dupes(&input, detection.apply(detector)?, json),
        Command::Fetch {
            urls,
            limit,
            detection,
        } => run_fetch(&runtime, &urls, limit, detection.apply(detector)?),
        Command::Download {
            urls,
            format,
            out,
            limit,
            skip_duplicates,
            archive,
            workers,
            detection,
        } => {
            let options = DownloadOptions {
                format,
                out: out.unwrap_or_else(|| runtime.download_root.clone()),
                limit,
                skip_duplicates,
                archive,
                workers: workers.unwrap_or(runtime.max_parallel_downloads),
            };
            run_download(&runtime, &urls, options, detection.apply(detector)?)
        }
    }
}

fn ytdlp_from(runtime: &RuntimeConfig) -> Result<YtDlp> {
    let ytdlp =
        YtDlp::new(&runtime.ytdlp_path).with_ffmpeg_location(runtime.ffmpeg_location.clone());
    ytdlp.ensure_available()?;
    Ok(ytdlp)
}

/// Accepts either a bare list or an object with a `videos` list.
fn read_check_request(input: &Path) -> Result<DuplicateCheckRequest> {
    let raw = if input == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("reading stdin")?;
        buffer
    } else {
        fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?
    };

    let value: Value = serde_json::from_str(&raw).context("parsing input JSON")?;
    let videos = match value {
        Value::Object(mut fields) => fields.remove("videos").unwrap_or(Value::Null),
        other => other,
    };
    Ok(DuplicateCheckRequest {
        videos,
        ..DuplicateCheckRequest::default()
    })
}

fn run_dupes(input: &Path, detector: DuplicateDetector, json: bool) -> Result<()> {
    let check = read_check_request(input)?.validate()?;
    let report = detector.detect(&check.candidates);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let titles: Vec<&str> = check.candidates.iter().map(|c| c.title.as_str()).collect();
    print_report(&titles, &report, &detector);
    Ok(())
}

fn print_report(titles: &[&str], report: &DuplicateReport, detector: &DuplicateDetector) {
    println!(
        "Checked {} items (threshold {}, mode {:?})",
        titles.len(),
        detector.threshold(),
        detector.mode()
    );
    if report.is_empty() {
        println!("No duplicates found");
        return;
    }

    println!(
        "Found {} duplicate groups covering {} items",
        report.duplicate_groups.len(),
        report.duplicate_indices.len()
    );
    for (number, group) in report.duplicate_groups.iter().enumerate() {
        println!();
        println!("Group {}:", number + 1);
        for &index in group {
            println!("  [{index}] {}", titles[index]);
        }
    }
}

fn run_fetch(
    runtime: &RuntimeConfig,
    urls: &[String],
    limit: Option<usize>,
    detector: DuplicateDetector,
) -> Result<()> {
    let ytdlp = ytdlp_from(runtime)?;
    let resolution = ytdlp.resolve_all(urls, limit);
    for err in &resolution.errors {
        eprintln!("  Warning: {err}");
    }
    if resolution.videos.is_empty() {
        bail!("No videos found");
    }

    let titles: Vec<&str> = resolution.videos.iter().map(|v| v.title.as_str()).collect();
    let report = detector.detect_titles(&titles);

    println!("Found {} entries", resolution.videos.len());
    println!();
    for (index, video) in resolution.videos.iter().enumerate() {
        let marker = match report.group_of(index) {
            Some(group) => format!(" [duplicate group {group}]"),
            None => String::new(),
        };
        println!(
            "{:>4}. {} ({}){}",
            index + 1,
            video.title,
            video.duration_formatted.as_deref().unwrap_or("Unknown"),
            marker
        );
    }
    Ok(())
}

struct DownloadOptions {
    format: OutputFormat,
    out: PathBuf,
    limit: Option<usize>,
    skip_duplicates: bool,
    archive: bool,
    workers: usize,
}

/// Drops every entry except the first of each duplicate group.
fn without_duplicates(videos: Vec<VideoEntry>, report: &DuplicateReport) -> Vec<VideoEntry> {
    let redundant = report.redundant_indices();
    videos
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !redundant.contains(index))
        .map(|(_, video)| video)
        .collect()
}

fn run_download(
    runtime: &RuntimeConfig,
    urls: &[String],
    options: DownloadOptions,
    detector: DuplicateDetector,
) -> Result<()> {
    let ytdlp = ytdlp_from(runtime)?;
    ytdlp.ensure_ffmpeg()?;

    println!("===================================");
    println!("Song Downloader");
    println!("===================================");
    println!("Format: {}", options.format);
    println!("Output directory: {}", options.out.display());
    println!();

    println!("Resolving {} link(s)...", urls.len());
    let resolution = ytdlp.resolve_all(urls, options.limit);
    for err in &resolution.errors {
        eprintln!("  Warning: {err}");
    }
    let mut videos = resolution.videos;
    if videos.is_empty() {
        bail!("No videos found");
    }
    println!("Found {} entries", videos.len());

    if options.skip_duplicates {
        let report = detector.detect(
            &videos
                .iter()
                .map(VideoEntry::to_candidate)
                .collect::<Vec<_>>(),
        );
        let before = videos.len();
        videos = without_duplicates(videos, &report);
        println!(
            "Skipping {} duplicate(s) in {} group(s)",
            before - videos.len(),
            report.duplicate_groups.len()
        );
    }
    println!();

    fs::create_dir_all(&options.out)
        .with_context(|| format!("creating {}", options.out.display()))?;
    println!("Downloading {} entries...", videos.len());
    let results = session::download_batch(
        &ytdlp,
        &videos,
        &options.out,
        options.format,
        options.workers,
    );
    let session = DownloadSession::new("cli", &options.out, options.format, results);

    for outcome in &session.results {
        match (&outcome.filename, &outcome.error) {
            (Some(filename), _) if outcome.success => println!("  ok   {filename}"),
            (_, error) => eprintln!(
                "  FAIL {}: {}",
                outcome.title,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    println!();
    println!("===================================");
    println!(
        "Download complete! {}/{} succeeded",
        session.successful_count, session.total_count
    );
    println!("===================================");

    if options.archive && session.successful_count > 0 {
        let archive = options.out.join(ARCHIVE_NAME);
        let count = packaging::write_archive(&options.out, &archive)?;
        println!("Archive: {} ({count} files)", archive.display());
    }

    Ok(())
}
