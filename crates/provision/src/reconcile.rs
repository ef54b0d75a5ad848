//! Startup cross-check of key pool, archive and provisioning database.
//!
//! Archive-before-append means a crash between the two steps leaves a key
//! file in the archive with no record. Such a key is never drawn again, but
//! the device that carries it cannot be identified from the store alone, so
//! orphans are reported for the operator rather than repaired.

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use keyburn_core::{KeyFileName, Uid};

use crate::database::ProvisioningDatabase;
use crate::error::Result;
use crate::pool::{list_archived_keys, list_unused_keys};

/// Inconsistencies between the directories and the database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Archived key files with no database record
    pub orphaned_archive: Vec<KeyFileName>,
    /// Records whose key file is absent from the archive
    pub missing_from_archive: Vec<(Uid, KeyFileName)>,
    /// Unused key files that a record already assigns, or whose name is
    /// already taken in the archive
    pub pool_conflicts: Vec<KeyFileName>,
    /// Line of an ignored torn database row
    pub torn_tail_line: Option<usize>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_archive.is_empty()
            && self.missing_from_archive.is_empty()
            && self.pool_conflicts.is_empty()
            && self.torn_tail_line.is_none()
    }

    /// Emit one event per finding.
    pub fn log(&self) {
        if self.is_clean() {
            info!("Key store reconciliation clean");
            return;
        }
        for key in &self.orphaned_archive {
            warn!(
                key = %key,
                "Archived key file has no provisioning record (interrupted commit?)"
            );
        }
        for (uid, key) in &self.missing_from_archive {
            warn!(uid = %uid, key = %key, "Recorded key file missing from archive");
        }
        for key in &self.pool_conflicts {
            error!(
                key = %key,
                "Unused key file is already assigned or archived; excluded from pool"
            );
        }
        if let Some(line) = self.torn_tail_line {
            warn!(line, "Provisioning database ends with a torn row");
        }
    }
}

/// Compare the database against the pool and archive directories.
pub fn reconcile(
    database: &ProvisioningDatabase,
    pool_dir: &Path,
    archive_dir: &Path,
) -> Result<ReconcileReport> {
    let unused = list_unused_keys(pool_dir)?;
    let archived = list_archived_keys(archive_dir)?;

    let mut report = ReconcileReport {
        torn_tail_line: database.torn_tail().map(|t| t.line),
        ..Default::default()
    };

    report.orphaned_archive = archived
        .iter()
        .filter(|key| database.owner_of(key).is_none())
        .cloned()
        .collect();

    report.missing_from_archive = database
        .records()
        .into_iter()
        .filter(|record| !archived.contains(&record.key_file))
        .map(|record| (record.uid, record.key_file.clone()))
        .collect();

    report.pool_conflicts = unused
        .into_iter()
        .filter(|key| database.owner_of(key).is_some() || archived.contains(key))
        .collect();

    report.orphaned_archive.sort();
    report.missing_from_archive.sort();
    report.pool_conflicts.sort();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn key(s: &str) -> KeyFileName {
        KeyFileName::parse(s).unwrap()
    }

    #[test]
    fn test_reconcile_findings() {
        let root = TempDir::new().unwrap();
        let pool_dir = root.path().join("keys");
        let archive_dir = pool_dir.join("used");
        fs::create_dir_all(&archive_dir).unwrap();

        // 0001: recorded and archived. 0002: archived, no record.
        // 0003: recorded, not archived. 0004: recorded, still in pool.
        fs::write(archive_dir.join("0001"), b"k1").unwrap();
        fs::write(archive_dir.join("0002"), b"k2").unwrap();
        fs::write(pool_dir.join("0004"), b"k4").unwrap();
        fs::write(pool_dir.join("0005"), b"k5").unwrap();

        let db_path = pool_dir.join("used_keys.csv");
        fs::write(
            &db_path,
            "uid,keyfile,timestamp\n\
             000000000000000000000001,0001,1\n\
             000000000000000000000003,0003,3\n\
             000000000000000000000004,0004,4\n",
        )
        .unwrap();
        let db = ProvisioningDatabase::load(&db_path).unwrap();

        let report = reconcile(&db, &pool_dir, &archive_dir).unwrap();
        assert_eq!(report.orphaned_archive, vec![key("0002")]);
        assert_eq!(
            report.missing_from_archive,
            vec![
                ("000000000000000000000003".parse().unwrap(), key("0003")),
                ("000000000000000000000004".parse().unwrap(), key("0004")),
            ]
        );
        assert_eq!(report.pool_conflicts, vec![key("0004")]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_pool_key_already_archived_is_conflict() {
        let root = TempDir::new().unwrap();
        let archive_dir = root.path().join("used");
        fs::create_dir(&archive_dir).unwrap();
        // Left behind by a copy into the archive that never removed the source.
        fs::write(root.path().join("C0DE"), b"k").unwrap();
        fs::write(archive_dir.join("C0DE"), b"k").unwrap();
        fs::write(root.path().join("1A2B"), b"k").unwrap();
        let db_path = root.path().join("used_keys.csv");
        fs::write(&db_path, "uid,keyfile,timestamp\n").unwrap();

        let db = ProvisioningDatabase::load(&db_path).unwrap();
        let report = reconcile(&db, root.path(), &archive_dir).unwrap();
        assert_eq!(report.pool_conflicts, vec![key("C0DE")]);
        assert_eq!(report.orphaned_archive, vec![key("C0DE")]);
    }

    #[test]
    fn test_reconcile_clean() {
        let root = TempDir::new().unwrap();
        let archive_dir = root.path().join("used");
        fs::create_dir(&archive_dir).unwrap();
        fs::write(root.path().join("1A2B"), b"k").unwrap();
        let db_path = root.path().join("used_keys.csv");
        fs::write(&db_path, "uid,keyfile,timestamp\n").unwrap();

        let db = ProvisioningDatabase::load(&db_path).unwrap();
        let report = reconcile(&db, root.path(), &archive_dir).unwrap();
        assert!(report.is_clean());
    }
}
