//! Where processed images go
//!
//! Results land in a process-scoped temporary directory first. The user can
//! then copy them out with [`save_results`].

use crate::error::{BgError, Result};
use crate::logging::LogSink;
use image::RgbaImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RESULT_SUFFIX: &str = "_no_bg";

/// Temporary result directory, removed when dropped
#[derive(Debug)]
pub struct TempOutput {
    dir: TempDir,
}

impl TempOutput {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("bgstrip-")
            .tempdir()
            .map_err(|e| BgError::Other(format!("Failed to create output directory: {e}")))?;
        tracing::debug!("Temporary output directory: {}", dir.path().display());
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `image` as `<stem>_no_bg.png`
    ///
    /// If that name is taken a numeric suffix is appended (`<stem>_no_bg_1.png`, ...),
    /// so sources with the same stem from different folders never overwrite
    /// each other.
    pub fn save(&self, source: &Path, image: &RgbaImage) -> Result<PathBuf> {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("image");

        let mut dest = self.path().join(format!("{stem}{RESULT_SUFFIX}.png"));
        let mut n = 1;
        while dest.exists() {
            dest = self.path().join(format!("{stem}{RESULT_SUFFIX}_{n}.png"));
            n += 1;
        }

        image
            .save_with_format(&dest, image::ImageFormat::Png)
            .map_err(|e| BgError::file(&dest, e))?;
        Ok(dest)
    }

    /// Delete every file written so far
    pub fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(self.path()).map_err(|e| BgError::file(self.path(), e))?;
        for entry in entries {
            let path = entry.map_err(|e| BgError::file(self.path(), e))?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| BgError::file(&path, e))?;
        }
        Ok(())
    }
}

/// Copy result files out of the temporary directory
///
/// A single result is copied to `dest` as a file. Several results are copied
/// into `dest` as a directory (created if needed), keeping their file names.
/// Existing files are never overwritten. A failed copy is logged and does not
/// stop the others. Returns the paths written.
pub fn save_results(results: &[PathBuf], dest: &Path, log: &dyn LogSink) -> Result<Vec<PathBuf>> {
    match results {
        [] => {
            log.warn("No results to save.");
            Ok(Vec::new())
        }
        [single] => {
            let target = if dest.is_dir() {
                dest.join(file_name(single)?)
            } else {
                dest.to_path_buf()
            };
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| BgError::file(parent, e))?;
            }
            copy_new(single, &target)?;
            log.info(&format!("Saved {}", target.display()));
            Ok(vec![target])
        }
        many => {
            fs::create_dir_all(dest).map_err(|e| BgError::file(dest, e))?;
            let mut written = Vec::with_capacity(many.len());
            for source in many {
                let copied = file_name(source).and_then(|name| {
                    let target = dest.join(name);
                    copy_new(source, &target).map(|()| target)
                });
                match copied {
                    Ok(target) => written.push(target),
                    Err(e) => log.error(&e.to_string()),
                }
            }
            log.info(&format!(
                "Saved {}/{} image(s) to {}",
                written.len(),
                many.len(),
                dest.display()
            ));
            Ok(written)
        }
    }
}

/// Copy `source` to `target`, failing if `target` already exists
fn copy_new(source: &Path, target: &Path) -> Result<()> {
    let mut reader = fs::File::open(source).map_err(|e| BgError::file(source, e))?;
    let mut writer = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => BgError::file(target, "file already exists"),
            _ => BgError::file(target, e),
        })?;
    io::copy(&mut reader, &mut writer).map_err(|e| BgError::file(target, e))?;
    Ok(())
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| BgError::file(path, "path has no file name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, MemoryLogSink};

    #[test]
    fn test_save_names_result_after_source() {
        let output = TempOutput::new().unwrap();
        let image = RgbaImage::new(3, 2);

        let first = output.save(Path::new("/photos/cat.jpg"), &image).unwrap();
        assert_eq!(first.file_name().unwrap(), "cat_no_bg.png");

        let second = output.save(Path::new("/other/cat.png"), &image).unwrap();
        assert_eq!(second.file_name().unwrap(), "cat_no_bg_1.png");

        let decoded = image::open(&first).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[test]
    fn test_clear_empties_directory() {
        let output = TempOutput::new().unwrap();
        output.save(Path::new("a.png"), &RgbaImage::new(1, 1)).unwrap();
        output.save(Path::new("b.png"), &RgbaImage::new(1, 1)).unwrap();

        output.clear().unwrap();
        assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
        assert!(output.path().exists());
    }

    #[test]
    fn test_directory_removed_on_drop() {
        let output = TempOutput::new().unwrap();
        let path = output.path().to_path_buf();
        drop(output);
        assert!(!path.exists());
    }

    #[test]
    fn test_save_single_result_to_file() {
        let output = TempOutput::new().unwrap();
        let result = output.save(Path::new("a.png"), &RgbaImage::new(1, 1)).unwrap();

        let dest_dir = TempDir::new().unwrap();
        let dest = dest_dir.path().join("out.png");
        let log = MemoryLogSink::new();

        let written = save_results(&[result], &dest, &log).unwrap();
        assert_eq!(written, vec![dest.clone()]);
        assert!(dest.is_file());
    }

    #[test]
    fn test_save_many_results_into_folder() {
        let output = TempOutput::new().unwrap();
        let results = vec![
            output.save(Path::new("a.png"), &RgbaImage::new(1, 1)).unwrap(),
            output.save(Path::new("b.png"), &RgbaImage::new(1, 1)).unwrap(),
        ];

        let dest_dir = TempDir::new().unwrap();
        let dest = dest_dir.path().join("exported");
        let log = MemoryLogSink::new();

        let written = save_results(&results, &dest, &log).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dest.join("a_no_bg.png").is_file());
        assert!(dest.join("b_no_bg.png").is_file());
    }

    #[test]
    fn test_save_never_overwrites() {
        let output = TempOutput::new().unwrap();
        let results = vec![
            output.save(Path::new("a.png"), &RgbaImage::new(1, 1)).unwrap(),
            output.save(Path::new("b.png"), &RgbaImage::new(1, 1)).unwrap(),
        ];

        let dest_dir = TempDir::new().unwrap();
        let taken = dest_dir.path().join("a_no_bg.png");
        fs::write(&taken, b"keep me").unwrap();
        let log = MemoryLogSink::new();

        let written = save_results(&results, dest_dir.path(), &log).unwrap();
        assert_eq!(written, vec![dest_dir.path().join("b_no_bg.png")]);
        assert_eq!(fs::read(&taken).unwrap(), b"keep me");
        let errors = log.messages(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("already exists"));

        // A single result into a folder already holding that name
        let err = save_results(&results[..1], dest_dir.path(), &log).unwrap_err();
        assert!(matches!(err, BgError::FileIo { .. }));
        assert_eq!(fs::read(&taken).unwrap(), b"keep me");
    }

    #[test]
    fn test_save_single_result_into_existing_folder() {
        let output = TempOutput::new().unwrap();
        let result = output.save(Path::new("a.png"), &RgbaImage::new(1, 1)).unwrap();
        let dest_dir = TempDir::new().unwrap();

        let written = save_results(&[result], dest_dir.path(), &MemoryLogSink::new()).unwrap();
        assert_eq!(written, vec![dest_dir.path().join("a_no_bg.png")]);
    }

    #[test]
    fn test_save_many_isolates_failures() {
        let output = TempOutput::new().unwrap();
        let good = output.save(Path::new("a.png"), &RgbaImage::new(1, 1)).unwrap();
        let missing = output.path().join("gone_no_bg.png");

        let dest_dir = TempDir::new().unwrap();
        let log = MemoryLogSink::new();

        let written = save_results(&[missing, good], dest_dir.path(), &log).unwrap();
        assert_eq!(written, vec![dest_dir.path().join("a_no_bg.png")]);
        assert_eq!(log.messages(LogLevel::Error).len(), 1);
    }
}
