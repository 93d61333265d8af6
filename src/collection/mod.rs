//! Ordered, duplicate-free set of image paths with change notification

use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// File extensions accepted as input images (lowercase)
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Whether `path` has a supported image extension, ignoring case
#[must_use]
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// `path` made absolute against the working directory, with `.` segments dropped
fn absolute(path: &Path) -> Option<PathBuf> {
    std::path::absolute(path).ok()
}

/// Insertion-ordered image paths
///
/// Every mutation that changes the contents bumps a version counter that
/// subscribers observe through a `watch` channel. No-op mutations leave it
/// untouched.
#[derive(Debug)]
pub struct ImageCollection {
    paths: Vec<PathBuf>,
    version: watch::Sender<u64>,
}

impl Default for ImageCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCollection {
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            paths: Vec::new(),
            version,
        }
    }

    /// Append supported, not yet present paths in order
    ///
    /// Paths are stored absolute, so `a.png`, `./a.png` and `$PWD/a.png` are
    /// the same entry. Returns the number of paths added. Paths that exist
    /// but are not regular files, and files with unsupported extensions, are
    /// skipped with a warning.
    pub fn add<I, P>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut added = 0;
        for path in paths {
            let path = path.into();
            let Some(path) = absolute(&path) else {
                tracing::warn!("Skipping {}: cannot resolve path", path.display());
                continue;
            };
            if path.exists() && !path.is_file() {
                tracing::warn!("Skipping {}: not a file", path.display());
                continue;
            }
            if !is_supported(&path) {
                tracing::warn!("Skipping {}: unsupported image format", path.display());
                continue;
            }
            if self.paths.contains(&path) {
                tracing::debug!("Skipping {}: already in collection", path.display());
                continue;
            }
            self.paths.push(path);
            added += 1;
        }

        if added > 0 {
            self.notify();
        }
        added
    }

    /// Remove `path` if present
    pub fn remove(&mut self, path: &Path) -> bool {
        let Some(path) = absolute(path) else {
            return false;
        };
        let Some(index) = self.paths.iter().position(|p| *p == path) else {
            return false;
        };
        self.paths.remove(index);
        self.notify();
        true
    }

    pub fn clear(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        self.paths.clear();
        self.notify();
    }

    /// Snapshot of the current paths
    #[must_use]
    pub fn list(&self) -> Vec<PathBuf> {
        self.paths.clone()
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        absolute(path).is_some_and(|path| self.paths.contains(&path))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Number of changes so far
    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Receiver that is marked changed after every mutation
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported() {
        assert!(is_supported(Path::new("a.png")));
        assert!(is_supported(Path::new("dir/b.JPG")));
        assert!(is_supported(Path::new("c.Jpeg")));
        assert!(!is_supported(Path::new("d.gif")));
        assert!(!is_supported(Path::new("png")));
        assert!(!is_supported(Path::new("e.png.txt")));
    }

    fn cwd(name: &str) -> PathBuf {
        std::env::current_dir().unwrap().join(name)
    }

    #[test]
    fn test_add_drops_duplicates_with_one_notification() {
        let mut collection = ImageCollection::new();
        let rx = collection.subscribe();

        assert_eq!(collection.add(["a.png", "a.png", "b.jpg"]), 2);
        assert_eq!(collection.list(), vec![cwd("a.png"), cwd("b.jpg")]);
        assert_eq!(collection.version(), 1);
        assert!(rx.has_changed().unwrap());

        assert_eq!(collection.add(["b.jpg"]), 0);
        assert_eq!(collection.version(), 1);
    }

    #[test]
    fn test_add_skips_unsupported_and_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let folder = dir.path().join("folder.png");
        std::fs::create_dir(&folder).unwrap();

        let mut collection = ImageCollection::new();
        assert_eq!(collection.add([folder, PathBuf::from("notes.txt")]), 0);
        assert!(collection.is_empty());
        assert_eq!(collection.version(), 0);
    }

    #[test]
    fn test_remove() {
        let mut collection = ImageCollection::new();
        collection.add(["a.png", "b.png"]);
        let before = collection.version();

        assert!(!collection.remove(Path::new("c.png")));
        assert_eq!(collection.version(), before);

        assert!(collection.remove(Path::new("a.png")));
        assert_eq!(collection.version(), before + 1);
        assert_eq!(collection.list(), vec![cwd("b.png")]);
        assert!(!collection.contains(Path::new("a.png")));
        assert!(collection.contains(Path::new("./b.png")));
    }

    #[test]
    fn test_same_file_spelled_differently_is_one_entry() {
        let mut collection = ImageCollection::new();
        let added = collection.add([
            PathBuf::from("a.png"),
            PathBuf::from("./a.png"),
            cwd("a.png"),
        ]);

        assert_eq!(added, 1);
        assert_eq!(collection.list(), vec![cwd("a.png")]);
        assert!(collection.list()[0].is_absolute());

        assert!(collection.remove(&cwd("a.png")));
        assert!(collection.is_empty());
    }

    #[test]
    fn test_clear_notifies_only_when_non_empty() {
        let mut collection = ImageCollection::new();
        collection.clear();
        assert_eq!(collection.version(), 0);

        collection.add(["a.png"]);
        collection.clear();
        assert_eq!(collection.version(), 2);
        assert!(collection.is_empty());
        assert_eq!(collection.len(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_change() {
        let mut collection = ImageCollection::new();
        let mut rx = collection.subscribe();

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            *rx.borrow_and_update()
        });

        collection.add(["a.png"]);
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
