//! Cheap change detection for the local image

use std::path::Path;
use std::time::SystemTime;

/// Size and modification time of a file, compared for equality only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

/// Fingerprint a regular file, or `None` if it doesn't exist
pub async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    Some(Fingerprint {
        len: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

/// Whether `current` matches the last pushed fingerprint
pub fn unchanged(previous: Option<&Fingerprint>, current: &Fingerprint) -> bool {
    previous == Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fingerprint(&dir.path().join("missing.png")).await.is_none());
        // Directories are not images
        assert!(fingerprint(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");

        std::fs::write(&path, b"first").unwrap();
        let first = fingerprint(&path).await.unwrap();
        assert_eq!(fingerprint(&path).await, Some(first));

        std::fs::write(&path, b"second render").unwrap();
        let second = fingerprint(&path).await.unwrap();
        assert_ne!(first, second);

        // Same size, later modification time
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        let third = fingerprint(&path).await.unwrap();
        assert_ne!(second, third);
    }

    #[test]
    fn test_unchanged() {
        let a = Fingerprint {
            len: 10,
            modified: Some(SystemTime::UNIX_EPOCH),
        };
        let b = Fingerprint { len: 11, ..a };

        assert!(!unchanged(None, &a));
        assert!(unchanged(Some(&a), &a));
        assert!(!unchanged(Some(&a), &b));
    }
}
