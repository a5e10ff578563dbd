//! Bundles a session directory into a single gzipped tarball.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::{Compression, write::GzEncoder};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

pub const ARCHIVE_NAME: &str = "songs.tar.gz";

/// Files with these extensions end up in the archive.
pub const MEDIA_EXTENSIONS: &[&str] = &["mp3", "m4a", "mp4", "webm"];

/// Media files directly inside `dir`, sorted by name.
pub fn collect_media_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_media = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_media {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Writes every media file of `dir` into a `.tar.gz` at `destination` and
/// returns how many files went in. The archive is built in a temporary file
/// next to `destination` and renamed over it once complete, so readers never
/// see a partial archive.
pub fn write_archive(dir: &Path, destination: &Path) -> Result<usize> {
    let files = collect_media_files(dir)?;
    if files.is_empty() {
        bail!("no media files in {}", dir.display());
    }

    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temporary archive in {}", parent.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(temp, Compression::default()));

    for path in &files {
        let name = path
            .file_name()
            .with_context(|| format!("{} has no file name", path.display()))?;
        builder
            .append_path_with_name(path, name)
            .with_context(|| format!("adding {} to archive", path.display()))?;
    }

    let temp = builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("finishing {}", destination.display()))?;
    temp.persist(destination)
        .with_context(|| format!("moving archive to {}", destination.display()))?;
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::{
        fs::{self, File},
        io::Read,
    };
    use tempfile::tempdir;

    #[test]
    fn collects_only_media_files() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("b.mp3"), b"b")?;
        fs::write(dir.path().join("a.M4A"), b"a")?;
        fs::write(dir.path().join("notes.txt"), b"x")?;
        fs::create_dir(dir.path().join("nested.mp3"))?;

        let names: Vec<String> = collect_media_files(dir.path())?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.M4A", "b.mp3"]);
        Ok(())
    }

    #[test]
    fn archive_contains_media_files() -> Result<()> {
        let dir = tempdir()?;
        let songs = dir.path().join("session");
        fs::create_dir(&songs)?;
        fs::write(songs.join("One.mp3"), b"first")?;
        fs::write(songs.join("Two.mp4"), b"second")?;
        fs::write(songs.join("cover.jpg"), b"skip")?;

        let archive_path = dir.path().join(ARCHIVE_NAME);
        assert_eq!(write_archive(&songs, &archive_path)?, 2);

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&archive_path)?));
        let mut seen = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let mut body = String::new();
            entry.read_to_string(&mut body)?;
            seen.push((entry.path()?.to_string_lossy().into_owned(), body));
        }
        assert_eq!(
            seen,
            vec![
                ("One.mp3".to_string(), "first".to_string()),
                ("Two.mp4".to_string(), "second".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn archive_replaces_previous_without_leftovers() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("One.mp3"), b"first")?;
        let archive_path = dir.path().join(ARCHIVE_NAME);
        fs::write(&archive_path, b"stale")?;

        assert_eq!(write_archive(dir.path(), &archive_path)?, 1);
        assert_eq!(write_archive(dir.path(), &archive_path)?, 1);

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&archive_path)?));
        assert_eq!(archive.entries()?.count(), 1);
        let mut names: Vec<String> = fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        names.sort();
        assert_eq!(names, vec!["One.mp3".to_string(), ARCHIVE_NAME.to_string()]);
        Ok(())
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join(ARCHIVE_NAME);
        assert!(write_archive(dir.path(), &dest).is_err());
        assert!(!dest.exists());
    }
}
