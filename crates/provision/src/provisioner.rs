//! Provisioning orchestrator.
//!
//! Drives one device through the provisioning workflow and owns the
//! session's database and key pool.
//!
//! # States
//!
//! ```text
//! Start
//!     ↓
//! Connect ─→ ResetHalt ─→ ReadUid ─→ CheckSentinel ──(marker)──→ AlreadyProgrammed
//!                                        ↓
//!                                      Lookup
//!                           (record) ↙        ↘ (no record)
//!               ReprogramExisting               AssignNew
//!                           ↘                 ↙
//!                             EraseRegion
//!                                  ↓
//!                             FlashWrite
//!                                  ↓
//!                               Verify ──(mismatch / probe error)──→ ProgrammingFailed
//!                                  ↓
//!                               Commit
//!                                  ↓
//!                             Disconnect
//! ```
//!
//! Probe failures before `EraseRegion` are fatal and leave the device
//! untouched. Failures from `EraseRegion` through `Verify` end the session as
//! [`Outcome::ProgrammingFailed`] and return a newly drawn key to the pool.
//! `Disconnect` is entered on every path once a link was opened.
//!
//! A device that carries the sentinel but has no record was flashed by a
//! session that died before its commit. Its key region is read back and
//! matched against unused and orphaned archive keys; a match finishes that
//! commit so the key cannot be drawn for another device.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use keyburn_core::{unix_timestamp, KeyFileName, PathConfig, ProvisionConfig, Uid};

use crate::database::ProvisioningDatabase;
use crate::error::{io_error, ProvisionError, Result};
use crate::layout::FlashLayout;
use crate::pool::{archive, KeyPool};
use crate::probe::{DebugProbe, ProbeError, ProbeLink, ProbeSession};
use crate::reconcile::{reconcile, ReconcileReport};

/// Maximum number of transitions kept per session.
const MAX_HISTORY_SIZE: usize = 64;

/// Workflow state of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Start,
    Connect,
    ResetHalt,
    ReadUid,
    CheckSentinel,
    Lookup,
    ReprogramExisting,
    AssignNew,
    EraseRegion,
    FlashWrite,
    Verify,
    Commit,
    Disconnect,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Start => "START",
            SessionState::Connect => "CONNECT",
            SessionState::ResetHalt => "RESET_HALT",
            SessionState::ReadUid => "READ_UID",
            SessionState::CheckSentinel => "CHECK_SENTINEL",
            SessionState::Lookup => "LOOKUP",
            SessionState::ReprogramExisting => "REPROGRAM_EXISTING",
            SessionState::AssignNew => "ASSIGN_NEW",
            SessionState::EraseRegion => "ERASE_REGION",
            SessionState::FlashWrite => "FLASH_WRITE",
            SessionState::Verify => "VERIFY",
            SessionState::Commit => "COMMIT",
            SessionState::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    /// Unix seconds
    pub timestamp: u64,
}

/// Where the programmed key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOrigin {
    /// Drawn from the unused pool for a new device
    Assigned,
    /// Re-flashed from the archive for a device already on record
    Restored,
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOrigin::Assigned => f.write_str("assigned"),
            KeyOrigin::Restored => f.write_str("restored"),
        }
    }
}

/// Non-fatal terminal state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    ProgrammedOk {
        uid: Uid,
        key_file: KeyFileName,
        origin: KeyOrigin,
        /// BLAKE3 of the key blob
        fingerprint: String,
    },
    AlreadyProgrammed {
        uid: Uid,
        /// Whether the database holds a record for this UID
        recorded: bool,
        /// Key whose interrupted commit this session completed
        #[serde(skip_serializing_if = "Option::is_none")]
        recovered: Option<KeyFileName>,
    },
    ProgrammingFailed {
        uid: Uid,
        key_file: KeyFileName,
        origin: KeyOrigin,
        state: SessionState,
        reason: String,
    },
}

impl Outcome {
    /// One-line operator summary.
    pub fn status_line(&self) -> String {
        match self {
            Outcome::ProgrammedOk {
                uid, key_file, origin, ..
            } => format!("PROGRAMMED_OK {} key {} ({})", uid, key_file, origin),
            Outcome::AlreadyProgrammed {
                uid,
                recovered: Some(key),
                ..
            } => format!(
                "ALREADY_PROGRAMMED {} already programmed; recorded key {} from interrupted commit",
                uid, key
            ),
            Outcome::AlreadyProgrammed { uid, .. } => {
                format!("ALREADY_PROGRAMMED {} already programmed", uid)
            }
            Outcome::ProgrammingFailed {
                uid,
                key_file,
                state,
                reason,
                ..
            } => format!(
                "PROGRAMMING_FAILED {} key {} during {}: {}",
                uid, key_file, state, reason
            ),
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::ProgrammedOk { .. } | Outcome::AlreadyProgrammed { .. } => 0,
            Outcome::ProgrammingFailed { .. } => 2,
        }
    }

    pub fn uid(&self) -> Uid {
        match self {
            Outcome::ProgrammedOk { uid, .. }
            | Outcome::AlreadyProgrammed { uid, .. }
            | Outcome::ProgrammingFailed { uid, .. } => *uid,
        }
    }
}

/// Key selected for the current device.
struct Selection {
    key: KeyFileName,
    origin: KeyOrigin,
    path: PathBuf,
}

/// Unrecorded key that a sentinel-marked device may carry.
struct Candidate {
    key: KeyFileName,
    /// Already moved to the archive before the commit was cut short
    archived: bool,
    blob: Vec<u8>,
}

/// Prepare the key store tree before any device interaction.
///
/// The key directory must already exist. The archive directory and an empty
/// database are created when missing.
pub fn prepare_store(paths: &PathConfig) -> Result<()> {
    if !paths.key_dir.is_dir() {
        return Err(ProvisionError::Io {
            path: paths.key_dir.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "key directory does not exist"),
        });
    }
    if !paths.archive_dir.is_dir() {
        fs::create_dir_all(&paths.archive_dir).map_err(io_error(&paths.archive_dir))?;
        info!(path = %paths.archive_dir.display(), "Created archive directory");
    }
    ProvisioningDatabase::ensure_exists(&paths.database)?;
    Ok(())
}

/// Provisioning workflow for one station.
pub struct Provisioner {
    layout: FlashLayout,
    archive_dir: PathBuf,
    database: ProvisioningDatabase,
    pool: KeyPool,
    report: ReconcileReport,
    state: SessionState,
    history: VecDeque<StateTransition>,
}

impl Provisioner {
    /// Validate `config`, prepare the key store and load the session state.
    ///
    /// Fails before any device interaction if the store cannot be trusted.
    pub fn open(config: &ProvisionConfig) -> Result<Self> {
        config.validate()?;
        let layout = FlashLayout::from_memory_map(&config.memory)?;
        let paths = &config.paths;

        prepare_store(paths)?;
        let database = ProvisioningDatabase::load(&paths.database)?;
        if let Some(torn) = database.torn_tail() {
            return Err(ProvisionError::CorruptRecord {
                path: paths.database.clone(),
                line: torn.line,
                reason: format!("torn final row {:?}; repair before provisioning", torn.content),
            });
        }

        let mut pool = KeyPool::load(&paths.key_dir, config.pool.selection)?;
        let report = reconcile(&database, &paths.key_dir, &paths.archive_dir)?;
        report.log();
        for key in &report.pool_conflicts {
            pool.exclude(key);
        }

        info!(
            records = database.len(),
            unused = pool.len(),
            key_address = format_args!("{:#010x}", layout.key_address),
            "Provisioner ready"
        );

        Ok(Self {
            layout,
            archive_dir: paths.archive_dir.clone(),
            database,
            pool,
            report,
            state: SessionState::Start,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        })
    }

    /// Provision the device reachable through `probe`.
    ///
    /// `Ok` carries every non-fatal terminal state. The probe link is
    /// released before this returns, whatever the result.
    pub fn run<P: DebugProbe>(&mut self, probe: &mut P) -> Result<Outcome> {
        self.history.clear();
        self.state = SessionState::Start;

        self.enter(SessionState::Connect);
        let mut session = ProbeSession::open(probe).map_err(|e| {
            error!(error = %e, "Cannot connect to debug probe");
            ProvisionError::Connect(e)
        })?;

        let result = self.run_session(&mut *session);

        self.enter(SessionState::Disconnect);
        if let Err(e) = session.close() {
            match &result {
                Ok(_) => warn!(error = %e, "Probe disconnect failed after session completed"),
                Err(_) => error!(error = %e, "Probe disconnect failed after fatal error"),
            }
        }

        match &result {
            Ok(outcome) => info!(status = %outcome.status_line(), "Session finished"),
            Err(e) => error!(state = %self.last_active_state(), error = %e, "Session aborted"),
        }
        result
    }

    fn run_session<L: ProbeLink>(&mut self, link: &mut L) -> Result<Outcome> {
        self.enter(SessionState::ResetHalt);
        link.reset_halt().map_err(|e| self.probe_error(e))?;

        self.enter(SessionState::ReadUid);
        let uid = link
            .read_uid(self.layout.uid_address)
            .map_err(|e| self.probe_error(e))?;
        info!(uid = %uid, "Device UID read");

        self.enter(SessionState::CheckSentinel);
        let marker = link
            .read_memory(self.layout.key_address, self.layout.sentinel.len())
            .map_err(|e| self.probe_error(e))?;
        if self.layout.is_sentinel(&marker) {
            if self.database.get(&uid).is_some() {
                return Ok(Outcome::AlreadyProgrammed {
                    uid,
                    recorded: true,
                    recovered: None,
                });
            }
            warn!(
                uid = %uid,
                "Sentinel present but UID has no provisioning record (interrupted commit?)"
            );
            self.enter(SessionState::Lookup);
            let recovered = self.recover_commit(link, &uid)?;
            return Ok(Outcome::AlreadyProgrammed {
                uid,
                recorded: recovered.is_some(),
                recovered,
            });
        }

        self.enter(SessionState::Lookup);
        let selection = self.select_key(&uid)?;
        let prepared = read_key_blob(&selection.path).and_then(|blob| {
            let span = self.layout.erase_span(blob.len() as u64)?;
            Ok((blob, span))
        });
        let (blob, span) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if selection.origin == KeyOrigin::Assigned {
                    self.pool.restore(selection.key);
                }
                return Err(e);
            }
        };
        if !blob.starts_with(&self.layout.sentinel) {
            warn!(
                key = %selection.key,
                "Key blob does not start with the sentinel; the device will not read as programmed"
            );
        }
        let fingerprint = blake3::hash(&blob).to_hex().to_string();

        if let Err(reason) = self.program(link, &selection.path, span) {
            let state = self.state;
            if selection.origin == KeyOrigin::Assigned {
                self.pool.restore(selection.key.clone());
            }
            warn!(
                uid = %uid,
                key = %selection.key,
                state = %state,
                reason = %reason,
                "Programming failed; database and archive unchanged"
            );
            return Ok(Outcome::ProgrammingFailed {
                uid,
                key_file: selection.key,
                origin: selection.origin,
                state,
                reason,
            });
        }

        self.enter(SessionState::Commit);
        match selection.origin {
            KeyOrigin::Assigned => {
                archive(self.pool.dir(), &self.archive_dir, &selection.key)?;
                self.database
                    .append(uid, selection.key.clone(), unix_timestamp())?;
                info!(uid = %uid, key = %selection.key, fingerprint = %fingerprint, "Key committed");
            }
            KeyOrigin::Restored => {
                info!(uid = %uid, key = %selection.key, fingerprint = %fingerprint, "Recorded key restored");
            }
        }

        Ok(Outcome::ProgrammedOk {
            uid,
            key_file: selection.key,
            origin: selection.origin,
            fingerprint,
        })
    }

    /// Pick the archived key on record, or draw a new one.
    fn select_key(&mut self, uid: &Uid) -> Result<Selection> {
        let recorded = self.database.get(uid).map(|r| r.key_file.clone());
        match recorded {
            Some(key) => {
                self.enter(SessionState::ReprogramExisting);
                let path = self.archive_dir.join(&key);
                if !path.is_file() {
                    return Err(ProvisionError::KeyFile {
                        path,
                        reason: format!("key recorded for {} is missing from the archive", uid),
                    });
                }
                info!(uid = %uid, key = %key, "UID on record; restoring archived key");
                Ok(Selection {
                    key,
                    origin: KeyOrigin::Restored,
                    path,
                })
            }
            None => {
                self.enter(SessionState::AssignNew);
                let key = self.pool.take_one()?;
                let archived = self.archive_dir.join(&key);
                if archived.exists() {
                    self.pool.restore(key);
                    return Err(ProvisionError::Io {
                        path: archived,
                        source: std::io::Error::new(
                            std::io::ErrorKind::AlreadyExists,
                            "a key file with this name is already archived",
                        ),
                    });
                }
                info!(uid = %uid, key = %key, remaining = self.pool.len(), "Assigning new key");
                Ok(Selection {
                    path: self.pool.path_of(&key),
                    key,
                    origin: KeyOrigin::Assigned,
                })
            }
        }
    }

    /// Match the key region of an unrecorded, sentinel-marked device against
    /// unrecorded keys and commit the one it carries.
    fn recover_commit<L: ProbeLink>(&mut self, link: &mut L, uid: &Uid) -> Result<Option<KeyFileName>> {
        let pooled = self
            .pool
            .keys()
            .iter()
            .map(|key| (key.clone(), self.pool.path_of(key), false));
        let orphaned = self
            .report
            .orphaned_archive
            .iter()
            .filter(|key| self.database.owner_of(key).is_none())
            .map(|key| (key.clone(), self.archive_dir.join(key), true));

        let mut candidates = Vec::new();
        for (key, path, archived) in pooled.chain(orphaned).collect::<Vec<_>>() {
            match read_key_blob(&path) {
                Ok(blob) => candidates.push(Candidate { key, archived, blob }),
                Err(e) => debug!(key = %key, error = %e, "Skipping unreadable key file"),
            }
        }
        let Some(len) = candidates.iter().map(|c| c.blob.len()).max() else {
            return Ok(None);
        };

        let region = link
            .read_memory(self.layout.key_address, len)
            .map_err(|e| self.probe_error(e))?;
        let mut matches: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| region.starts_with(&c.blob))
            .collect();

        let candidate = match matches.len() {
            0 => {
                warn!(uid = %uid, "Device key region matches no unrecorded key file");
                return Ok(None);
            }
            1 => matches.remove(0),
            _ => {
                for c in &matches {
                    self.pool.exclude(&c.key);
                }
                error!(
                    uid = %uid,
                    keys = ?matches.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
                    "Device key region matches several key files; excluded them from the pool"
                );
                return Ok(None);
            }
        };

        self.enter(SessionState::Commit);
        let key = candidate.key;
        if !candidate.archived {
            self.pool.exclude(&key);
            archive(self.pool.dir(), &self.archive_dir, &key)?;
        }
        self.database.append(*uid, key.clone(), unix_timestamp())?;
        self.report.orphaned_archive.retain(|k| k != &key);
        info!(
            uid = %uid,
            key = %key,
            fingerprint = %blake3::hash(&candidate.blob).to_hex(),
            "Completed interrupted commit"
        );
        Ok(Some(key))
    }

    /// Erase, flash and verify. The error is a human-readable reason.
    fn program<L: ProbeLink>(&mut self, link: &mut L, blob: &Path, span: u32) -> std::result::Result<(), String> {
        let address = self.layout.key_address;

        self.enter(SessionState::EraseRegion);
        debug!(address = format_args!("{:#010x}", address), size = span, "Erasing key region");
        link.erase_region(address, span).map_err(|e| e.to_string())?;

        self.enter(SessionState::FlashWrite);
        link.flash_file(blob, address).map_err(|e| e.to_string())?;

        self.enter(SessionState::Verify);
        match link.verify_file(blob, address) {
            Ok(true) => Ok(()),
            Ok(false) => Err("verification mismatch".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn enter(&mut self, next: SessionState) {
        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from: self.state,
            to: next,
            timestamp: unix_timestamp(),
        });
        debug!(from = %self.state, to = %next, "Session state transition");
        self.state = next;
    }

    fn probe_error(&self, source: ProbeError) -> ProvisionError {
        ProvisionError::Probe {
            state: self.state,
            source,
        }
    }

    /// State the session was in before it started disconnecting.
    fn last_active_state(&self) -> SessionState {
        self.history
            .iter()
            .rev()
            .find(|t| t.to == SessionState::Disconnect)
            .map(|t| t.from)
            .unwrap_or(self.state)
    }

    pub fn database(&self) -> &ProvisioningDatabase {
        &self.database
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    /// Findings of the startup reconciliation.
    pub fn report(&self) -> &ReconcileReport {
        &self.report
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transitions of the most recent session.
    pub fn transitions(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }
}

fn read_key_blob(path: &Path) -> Result<Vec<u8>> {
    let blob = fs::read(path).map_err(|e| ProvisionError::KeyFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if blob.is_empty() {
        return Err(ProvisionError::KeyFile {
            path: path.to_path_buf(),
            reason: "key file is empty".to_string(),
        });
    }
    Ok(blob)
}
