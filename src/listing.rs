//! External listing of image files, the source of truth the catalog is
//! reconciled against.

use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Extensions (lowercase) picked up by [`FsListing`].
pub const IMAGE_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "gif", "bmp", "ico", "tiff", "tga", "webp",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
    /// Path relative to the listing root, `/`-separated.
    pub path: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("images root does not exist or is not a directory: {0}")]
    RootNotFound(PathBuf),

    #[error("failed to walk images root: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path escapes the images root: {0}")]
    InvalidPath(String),
}

pub trait Listing: Send + Sync {
    fn list(&self) -> Result<Vec<ListedItem>, ListingError>;
    fn read(&self, path: &str) -> Result<Vec<u8>, ListingError>;
}

/// Recursive listing of image files under a directory.
#[derive(Debug, Clone)]
pub struct FsListing {
    root: PathBuf,
}

impl FsListing {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ListingError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ListingError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl Listing for FsListing {
    fn list(&self) -> Result<Vec<ListedItem>, ListingError> {
        if !self.root.is_dir() {
            return Err(ListingError::RootNotFound(self.root.clone()));
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                // an unreadable root is as fatal as a missing one
                Err(err) if err.depth() == 0 => return Err(err.into()),
                Err(err) => {
                    log::warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !Self::is_image(entry.path()) {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let key = relative_key(relative);

            let modified = entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|metadata| metadata.modified());
            let modified = match modified {
                Ok(modified) => modified,
                Err(err) => {
                    log::warn!("skipping {key}: no modification time: {err}");
                    continue;
                }
            };

            items.push(ListedItem {
                path: key,
                modified: DateTime::<Utc>::from(modified),
            });
        }

        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ListingError> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|source| ListingError::Io {
            path: path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_fails_fast() {
        let listing = FsListing::new("/nonexistent/imgdex/root");
        assert!(matches!(listing.list(), Err(ListingError::RootNotFound(_))));
    }

    #[test]
    fn test_lists_images_recursively_and_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("nested/deeper")).unwrap();
        std::fs::write(tmp.path().join("b.PNG"), b"b").unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"a").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"skip").unwrap();
        std::fs::write(tmp.path().join("nested/deeper/c.webp"), b"c").unwrap();

        let listing = FsListing::new(tmp.path());
        let paths: Vec<String> = listing.list().unwrap().into_iter().map(|i| i.path).collect();

        assert_eq!(paths, vec!["a.jpg", "b.PNG", "nested/deeper/c.webp"]);
        assert_eq!(listing.read("nested/deeper/c.webp").unwrap(), b"c");
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_entries_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.jpg"), b"a").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone.jpg"), tmp.path().join("x.jpg")).unwrap();
        std::fs::create_dir(tmp.path().join("loop")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("loop"), tmp.path().join("loop/again")).unwrap();

        let listing = FsListing::new(tmp.path());
        let paths: Vec<String> = listing.list().unwrap().into_iter().map(|i| i.path).collect();

        assert_eq!(paths, vec!["a.jpg"]);
    }

    #[test]
    fn test_read_rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let listing = FsListing::new(tmp.path());

        assert!(matches!(
            listing.read("../etc/passwd"),
            Err(ListingError::InvalidPath(_))
        ));
        assert!(matches!(
            listing.read("/etc/passwd"),
            Err(ListingError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_is_image() {
        assert!(FsListing::is_image(Path::new("x/y.JPEG")));
        assert!(FsListing::is_image(Path::new("y.tga")));
        assert!(!FsListing::is_image(Path::new("y.svg")));
        assert!(!FsListing::is_image(Path::new("jpg")));
    }
}
