//! Provisioning database: durable UID → key file mapping.
//!
//! The store is a line-oriented CSV file with the fixed header
//! `uid,keyfile,timestamp`. It is only ever appended to. Each row is parsed
//! into a [`RowOutcome`]; any corrupt row aborts the load, with one
//! exception: a final row that has no terminating newline is a torn write
//! from an interrupted append, even if what survived happens to parse (a
//! timestamp cut short still reads as a number). It is reported through
//! [`ProvisioningDatabase::torn_tail`] rather than failing the load, and
//! blocks further appends until repaired.
//!
//! # Guarantees
//!
//! - A UID appears in at most one record
//! - A key file appears in at most one record
//! - Appends reach the disk (`sync_data`) before the in-memory map changes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use keyburn_core::{KeyFileName, Uid};

use crate::error::{io_error, ProvisionError, Result};

/// Header row of the store.
pub const HEADER: &str = "uid,keyfile,timestamp";

const FIELD_COUNT: usize = 3;

/// One committed key assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRecord {
    pub uid: Uid,
    pub key_file: KeyFileName,
    /// Unix seconds at commit
    pub timestamp: u64,
}

impl ProvisioningRecord {
    /// CSV rendering, without line terminator.
    pub fn to_row(&self) -> String {
        format!("{},{},{}", self.uid, self.key_file, self.timestamp)
    }
}

/// Result of parsing one data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Record(ProvisioningRecord),
    Corrupt { reason: String },
}

/// Parse one data row.
pub fn parse_row(line: &str) -> RowOutcome {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return RowOutcome::Corrupt {
            reason: format!("expected {} fields, got {}", FIELD_COUNT, fields.len()),
        };
    }

    let uid = match fields[0].parse::<Uid>() {
        Ok(uid) => uid,
        Err(e) => return RowOutcome::Corrupt { reason: e.to_string() },
    };
    let key_file = match KeyFileName::parse(fields[1]) {
        Ok(key) => key,
        Err(e) => return RowOutcome::Corrupt { reason: e.to_string() },
    };
    let timestamp = match fields[2].parse::<u64>() {
        Ok(ts) => ts,
        Err(e) => {
            return RowOutcome::Corrupt {
                reason: format!("invalid timestamp {:?}: {}", fields[2], e),
            }
        }
    };

    RowOutcome::Record(ProvisioningRecord {
        uid,
        key_file,
        timestamp,
    })
}

/// An unterminated, unparsable final row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    /// 1-based line number
    pub line: usize,
    pub content: String,
}

/// In-memory view of the provisioning database.
#[derive(Debug)]
pub struct ProvisioningDatabase {
    path: PathBuf,
    records: HashMap<Uid, ProvisioningRecord>,
    key_owners: HashMap<KeyFileName, Uid>,
    torn_tail: Option<TornTail>,
    /// File ends without a newline after the header or a blank line
    needs_terminator: bool,
}

impl ProvisioningDatabase {
    /// Create the store with only the header if it is absent or empty.
    ///
    /// Returns true if the file was written.
    pub fn ensure_exists(path: &Path) -> Result<bool> {
        let empty = match fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(io_error(path)(e)),
        };
        if !empty {
            return Ok(false);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error(path))?;
        file.write_all(format!("{}\n", HEADER).as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(io_error(path))?;

        info!(path = %path.display(), "Provisioning database created");
        Ok(true)
    }

    /// Load every record from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path).map_err(io_error(&path))?;
        let terminated = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();

        let corrupt = |line: usize, reason: String| ProvisionError::CorruptRecord {
            path: path.clone(),
            line,
            reason,
        };

        match lines.first().map(|l| l.trim_end_matches('\r').trim()) {
            Some(HEADER) => {}
            Some(other) => {
                return Err(corrupt(1, format!("expected header {:?}, got {:?}", HEADER, other)))
            }
            None => return Err(corrupt(1, "missing header row".to_string())),
        }

        let mut db = Self {
            path: path.clone(),
            records: HashMap::new(),
            key_owners: HashMap::new(),
            torn_tail: None,
            needs_terminator: !terminated,
        };

        for (idx, raw) in lines.iter().enumerate().skip(1) {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            if line_no == lines.len() && !terminated {
                let reason = match parse_row(line) {
                    RowOutcome::Record(_) => "row has no line terminator".to_string(),
                    RowOutcome::Corrupt { reason } => reason,
                };
                warn!(
                    path = %path.display(),
                    line = line_no,
                    reason = %reason,
                    "Ignoring torn final row of provisioning database"
                );
                db.torn_tail = Some(TornTail {
                    line: line_no,
                    content: line.to_string(),
                });
                db.needs_terminator = false;
                continue;
            }

            match parse_row(line) {
                RowOutcome::Record(record) => {
                    if let Some(existing) = db.records.get(&record.uid) {
                        return Err(corrupt(
                            line_no,
                            format!(
                                "duplicate UID {} (already assigned {})",
                                record.uid, existing.key_file
                            ),
                        ));
                    }
                    if let Some(owner) = db.key_owners.get(&record.key_file) {
                        return Err(corrupt(
                            line_no,
                            format!(
                                "key file {} already assigned to {}",
                                record.key_file, owner
                            ),
                        ));
                    }
                    db.insert(record);
                }
                RowOutcome::Corrupt { reason } => return Err(corrupt(line_no, reason)),
            }
        }

        info!(path = %path.display(), records = db.len(), "Provisioning database loaded");
        Ok(db)
    }

    fn insert(&mut self, record: ProvisioningRecord) {
        self.key_owners.insert(record.key_file.clone(), record.uid);
        self.records.insert(record.uid, record);
    }

    /// Durably append one record. This is the commit point of an assignment.
    pub fn append(
        &mut self,
        uid: Uid,
        key_file: KeyFileName,
        timestamp: u64,
    ) -> Result<&ProvisioningRecord> {
        if let Some(torn) = &self.torn_tail {
            return Err(ProvisionError::CorruptRecord {
                path: self.path.clone(),
                line: torn.line,
                reason: "database ends with a torn row; repair it before appending".to_string(),
            });
        }
        if let Some(existing) = self.records.get(&uid) {
            return Err(ProvisionError::AssignmentConflict {
                uid,
                key_file,
                reason: format!("UID already assigned {}", existing.key_file),
            });
        }
        if let Some(owner) = self.key_owners.get(&key_file) {
            return Err(ProvisionError::AssignmentConflict {
                uid,
                key_file,
                reason: format!("key file already assigned to {}", owner),
            });
        }

        let record = ProvisioningRecord {
            uid,
            key_file,
            timestamp,
        };
        let mut row = String::new();
        if self.needs_terminator {
            row.push('\n');
        }
        row.push_str(&record.to_row());
        row.push('\n');

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        file.write_all(row.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(io_error(&self.path))?;
        self.needs_terminator = false;

        info!(
            uid = %record.uid,
            key = %record.key_file,
            timestamp = record.timestamp,
            "Provisioning record committed"
        );
        self.insert(record);
        Ok(&self.records[&uid])
    }

    pub fn get(&self, uid: &Uid) -> Option<&ProvisioningRecord> {
        self.records.get(uid)
    }

    /// UID a key file was assigned to, if any.
    pub fn owner_of(&self, key_file: &KeyFileName) -> Option<&Uid> {
        self.key_owners.get(key_file)
    }

    /// Records ordered by commit time, then UID.
    pub fn records(&self) -> Vec<&ProvisioningRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.uid.cmp(&b.uid)));
        records
    }

    pub fn torn_tail(&self) -> Option<&TornTail> {
        self.torn_tail.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
