//! Key pool: unused key files and the archive they move to.
//!
//! A key file moves from the pool directory to the archive exactly once,
//! after the device it was flashed to has verified. Selection order is
//! whatever the directory listing yields unless [`PoolSelection::Sorted`]
//! is configured; either way a drawn key is never handed out twice.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use keyburn_core::{KeyFileName, PoolSelection};

use crate::error::{io_error, ProvisionError, Result};

/// List key files in `dir`, in listing order.
///
/// Only regular files whose name matches the key pattern are returned.
pub fn list_unused_keys(dir: &Path) -> Result<Vec<KeyFileName>> {
    list_key_files(dir)
}

/// List key files that have been committed to devices.
pub fn list_archived_keys(archive_dir: &Path) -> Result<Vec<KeyFileName>> {
    list_key_files(archive_dir)
}

fn list_key_files(dir: &Path) -> Result<Vec<KeyFileName>> {
    let entries = fs::read_dir(dir).map_err(io_error(dir))?;
    let mut keys = Vec::new();

    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !KeyFileName::is_key_name(&name) {
            continue;
        }
        if !entry.path().is_file() {
            debug!(name = %name, "Skipping non-file entry with key-like name");
            continue;
        }
        keys.push(KeyFileName::parse(&name)?);
    }

    Ok(keys)
}

/// In-memory set of unused key files for one session.
#[derive(Debug, Clone)]
pub struct KeyPool {
    dir: PathBuf,
    /// Drawn from the back
    keys: Vec<KeyFileName>,
}

impl KeyPool {
    /// Scan `dir` for unused keys.
    pub fn load(dir: impl Into<PathBuf>, selection: PoolSelection) -> Result<Self> {
        let dir = dir.into();
        let keys = list_unused_keys(&dir)?;
        let pool = Self::from_keys(dir, keys, selection);
        info!(dir = %pool.dir.display(), unused = pool.len(), "Key pool loaded");
        Ok(pool)
    }

    pub fn from_keys(
        dir: impl Into<PathBuf>,
        mut keys: Vec<KeyFileName>,
        selection: PoolSelection,
    ) -> Self {
        if selection == PoolSelection::Sorted {
            // Descending, so popping yields the smallest name first.
            keys.sort_by(|a, b| b.cmp(a));
        }
        Self {
            dir: dir.into(),
            keys,
        }
    }

    /// Remove and return one key.
    pub fn take_one(&mut self) -> Result<KeyFileName> {
        self.keys.pop().ok_or_else(|| ProvisionError::PoolExhausted {
            dir: self.dir.clone(),
        })
    }

    /// Return a drawn key after a failed programming attempt. It becomes the
    /// next key drawn.
    pub fn restore(&mut self, key: KeyFileName) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Drop a key from this session's pool. Returns true if it was present.
    pub fn exclude(&mut self, key: &KeyFileName) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k != key);
        before != self.keys.len()
    }

    /// Remaining keys, last drawn first.
    pub fn keys(&self) -> &[KeyFileName] {
        &self.keys
    }

    pub fn contains(&self, key: &KeyFileName) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// On-disk location of an unused key.
    pub fn path_of(&self, key: &KeyFileName) -> PathBuf {
        self.dir.join(key)
    }
}

/// Move `key` from the pool directory into the archive.
///
/// Never overwrites an archived key. Returns the archived path.
pub fn archive(pool_dir: &Path, archive_dir: &Path, key: &KeyFileName) -> Result<PathBuf> {
    let src = pool_dir.join(key);
    let dst = archive_dir.join(key);

    if !src.is_file() {
        return Err(ProvisionError::Io {
            path: src,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "key file missing from pool"),
        });
    }
    if dst.exists() {
        return Err(ProvisionError::Io {
            path: dst,
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "key file already archived",
            ),
        });
    }

    if let Err(rename_err) = fs::rename(&src, &dst) {
        warn!(
            key = %key,
            error = %rename_err,
            "Rename into archive failed, falling back to copy"
        );
        copy_then_remove(&src, &dst).map_err(|_| ProvisionError::Io {
            path: dst.clone(),
            source: rename_err,
        })?;
    }

    sync_dir(archive_dir)?;
    sync_dir(pool_dir)?;
    info!(key = %key, archive = %archive_dir.display(), "Key file archived");
    Ok(dst)
}

fn copy_then_remove(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::copy(src, dst)?;
    fs::File::open(dst)?.sync_all()?;
    fs::remove_file(src)
}

/// Flush a directory entry change to disk.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_error(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(name: &str) -> KeyFileName {
        KeyFileName::parse(name).unwrap()
    }

    fn pool_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in ["1A2B", "00ff", "C0DE"] {
            fs::write(dir.path().join(name), [0xDC, 0xDC, 1, 2]).unwrap();
        }
        fs::write(dir.path().join("used_keys.csv"), "uid,keyfile,timestamp\n").unwrap();
        fs::write(dir.path().join("README"), "not a key").unwrap();
        fs::write(dir.path().join("12345"), "too long").unwrap();
        fs::create_dir(dir.path().join("used")).unwrap();
        fs::create_dir(dir.path().join("BEEF")).unwrap();
        dir
    }

    #[test]
    fn test_list_filters_non_keys() {
        let dir = pool_dir();
        let mut keys = list_unused_keys(dir.path()).unwrap();
        keys.sort();
        assert_eq!(keys, vec![key("00ff"), key("1A2B"), key("C0DE")]);
    }

    #[test]
    fn test_list_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(list_unused_keys(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_list_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = list_unused_keys(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ProvisionError::Io { .. }));
    }

    #[test]
    fn test_take_one_is_exclusive() {
        let dir = pool_dir();
        let mut pool = KeyPool::load(dir.path(), PoolSelection::Arbitrary).unwrap();
        let mut drawn = Vec::new();
        while let Ok(k) = pool.take_one() {
            assert!(!drawn.contains(&k));
            drawn.push(k);
        }
        assert_eq!(drawn.len(), 3);
        assert!(matches!(
            pool.take_one(),
            Err(ProvisionError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_sorted_selection_is_ascending() {
        let mut pool = KeyPool::from_keys(
            "keys",
            vec![key("C0DE"), key("00FF"), key("1A2B")],
            PoolSelection::Sorted,
        );
        assert_eq!(pool.take_one().unwrap(), key("00FF"));
        assert_eq!(pool.take_one().unwrap(), key("1A2B"));
        assert_eq!(pool.take_one().unwrap(), key("C0DE"));
    }

    #[test]
    fn test_restore_makes_key_next() {
        let mut pool = KeyPool::from_keys(
            "keys",
            vec![key("0001"), key("0002")],
            PoolSelection::Sorted,
        );
        let first = pool.take_one().unwrap();
        pool.restore(first.clone());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.take_one().unwrap(), first);
    }

    #[test]
    fn test_exclude() {
        let mut pool = KeyPool::from_keys("keys", vec![key("0001")], PoolSelection::Arbitrary);
        assert!(pool.exclude(&key("0001")));
        assert!(!pool.exclude(&key("0001")));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_archive_moves_file() {
        let dir = pool_dir();
        let archive_dir = dir.path().join("used");
        let dst = archive(dir.path(), &archive_dir, &key("1A2B")).unwrap();

        assert!(!dir.path().join("1A2B").exists());
        assert_eq!(fs::read(dst).unwrap(), vec![0xDC, 0xDC, 1, 2]);
        assert_eq!(list_archived_keys(&archive_dir).unwrap(), vec![key("1A2B")]);
    }

    #[test]
    fn test_archive_missing_source() {
        let dir = pool_dir();
        let err = archive(dir.path(), &dir.path().join("used"), &key("FFFF")).unwrap_err();
        assert!(matches!(err, ProvisionError::Io { .. }));
    }

    #[test]
    fn test_archive_never_overwrites() {
        let dir = pool_dir();
        let archive_dir = dir.path().join("used");
        fs::write(archive_dir.join("C0DE"), b"earlier").unwrap();

        let err = archive(dir.path(), &archive_dir, &key("C0DE")).unwrap_err();
        assert!(matches!(err, ProvisionError::Io { .. }));
        assert!(dir.path().join("C0DE").exists());
        assert_eq!(fs::read(archive_dir.join("C0DE")).unwrap(), b"earlier");
    }
}
