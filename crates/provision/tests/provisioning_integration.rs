use keyburn_core::{KeyFileName, PoolSelection, ProvisionConfig, Uid};
use keyburn_provision::{
    KeyOrigin, Outcome, ProbeError, ProvisionError, Provisioner, SessionState, SimFaults, SimProbe,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const KEY_ADDR: u32 = 0x0800_FFD4;
const UID_A: &str = "AABBCC000000000000000001";

struct Station {
    _root: TempDir,
    config: ProvisionConfig,
}

impl Station {
    fn key_dir(&self) -> PathBuf {
        self.config.paths.key_dir.clone()
    }

    fn archive_dir(&self) -> PathBuf {
        self.config.paths.archive_dir.clone()
    }

    fn database(&self) -> String {
        fs::read_to_string(&self.config.paths.database).unwrap()
    }

    fn add_key(&self, name: &str) {
        fs::write(self.key_dir().join(name), key_blob(name)).unwrap();
    }

    fn open(&self) -> Provisioner {
        Provisioner::open(&self.config).unwrap()
    }

    fn device(&self, uid: &str) -> SimProbe {
        SimProbe::new(uid.parse().unwrap(), &self.config.memory)
    }
}

fn key_blob(name: &str) -> Vec<u8> {
    let mut blob = vec![0xDC, 0xDC];
    blob.extend_from_slice(name.as_bytes());
    blob.extend_from_slice(&[0x5A; 38]);
    blob
}

fn station(keys: &[&str]) -> Station {
    let root = TempDir::new().unwrap();
    let key_dir = root.path().join("keys");
    fs::create_dir(&key_dir).unwrap();

    let mut config = ProvisionConfig::default();
    config.paths.archive_dir = key_dir.join("used");
    config.paths.database = key_dir.join("used_keys.csv");
    config.paths.key_dir = key_dir;
    config.pool.selection = PoolSelection::Sorted;

    let station = Station {
        _root: root,
        config,
    };
    for key in keys {
        station.add_key(key);
    }
    station
}

fn key(name: &str) -> KeyFileName {
    KeyFileName::parse(name).unwrap()
}

fn uid(s: &str) -> Uid {
    s.parse().unwrap()
}

fn assert_released(probe: &SimProbe) {
    let stats = probe.stats();
    assert_eq!(stats.connects, stats.disconnects, "probe link leaked: {stats:?}");
}

#[test]
fn integration_new_device_gets_pool_key() {
    let station = station(&["1A2B"]);
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);

    let outcome = provisioner.run(&mut probe).unwrap();
    match &outcome {
        Outcome::ProgrammedOk {
            uid: got,
            key_file,
            origin,
            fingerprint,
        } => {
            assert_eq!(*got, uid(UID_A));
            assert_eq!(*key_file, key("1A2B"));
            assert_eq!(*origin, KeyOrigin::Assigned);
            assert_eq!(fingerprint.len(), 64);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 0);

    let db = station.database();
    let row = db.lines().nth(1).unwrap();
    assert!(row.starts_with("AABBCC000000000000000001,1A2B,"));
    assert!(!station.key_dir().join("1A2B").exists());
    assert_eq!(
        fs::read(station.archive_dir().join("1A2B")).unwrap(),
        key_blob("1A2B")
    );
    assert!(provisioner.pool().is_empty());
    assert_eq!(probe.peek(KEY_ADDR, key_blob("1A2B").len()), key_blob("1A2B"));
    assert_released(&probe);
}

#[test]
fn integration_programmed_device_is_left_alone() {
    let station = station(&["1A2B", "00FF"]);
    let mut probe = station.device(UID_A);
    station.open().run(&mut probe).unwrap();

    let db_before = station.database();
    probe.reset_stats();

    let mut provisioner = station.open();
    let outcome = provisioner.run(&mut probe).unwrap();
    assert_eq!(
        outcome,
        Outcome::AlreadyProgrammed {
            uid: uid(UID_A),
            recorded: true,
            recovered: None,
        }
    );
    assert_eq!(probe.stats().write_path_calls(), 0);
    assert_eq!(station.database(), db_before);
    assert!(station.key_dir().join("1A2B").exists());
    assert_eq!(provisioner.pool().len(), 1);
    assert_released(&probe);
}

#[test]
fn integration_empty_pool_is_fatal_without_writes() {
    let station = station(&[]);
    let mut probe = station.device(UID_A);
    let mut provisioner = station.open();

    let err = provisioner.run(&mut probe).unwrap_err();
    assert!(matches!(err, ProvisionError::PoolExhausted { .. }));
    assert_eq!(station.database(), "uid,keyfile,timestamp\n");
    assert_eq!(probe.stats().write_path_calls(), 0);
    assert_eq!(probe.stats().connects, 1);
    assert_released(&probe);
}

#[test]
fn integration_each_key_used_exactly_once() {
    let names = ["0001", "0002", "0003", "0004", "0005"];
    let station = station(&names);
    let mut provisioner = station.open();

    let mut assigned = Vec::new();
    for i in 0..names.len() {
        let mut probe = station.device(&format!("0000000000000000000000{:02X}", i + 1));
        match provisioner.run(&mut probe).unwrap() {
            Outcome::ProgrammedOk { key_file, .. } => assigned.push(key_file),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_released(&probe);
    }

    let mut sorted = assigned.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), names.len());
    assert_eq!(provisioner.database().len(), names.len());
    assert_eq!(fs::read_dir(station.archive_dir()).unwrap().count(), names.len());

    let mut probe = station.device("0000000000000000000000FF");
    assert!(matches!(
        provisioner.run(&mut probe),
        Err(ProvisionError::PoolExhausted { .. })
    ));
}

#[test]
fn integration_failed_verify_keeps_key_in_pool() {
    let station = station(&["1A2B", "00FF"]);
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);
    probe.set_faults(SimFaults {
        corrupt_writes: true,
        ..Default::default()
    });

    let outcome = provisioner.run(&mut probe).unwrap();
    match &outcome {
        Outcome::ProgrammingFailed {
            key_file, state, ..
        } => {
            assert_eq!(*key_file, key("00FF"));
            assert_eq!(*state, SessionState::Verify);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(station.database(), "uid,keyfile,timestamp\n");
    assert!(station.key_dir().join("00FF").exists());
    assert!(!station.archive_dir().join("00FF").exists());
    assert!(provisioner.pool().contains(&key("00FF")));
    assert_released(&probe);

    // Retry in the same process picks the same key.
    probe.clear_faults();
    match provisioner.run(&mut probe).unwrap() {
        Outcome::ProgrammedOk { key_file, .. } => assert_eq!(key_file, key("00FF")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_released(&probe);
}

#[test]
fn integration_probe_error_after_erase_is_programming_failure() {
    let station = station(&["1A2B"]);
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);
    probe.set_faults(SimFaults {
        fail_erase: true,
        ..Default::default()
    });

    match provisioner.run(&mut probe).unwrap() {
        Outcome::ProgrammingFailed { state, origin, .. } => {
            assert_eq!(state, SessionState::EraseRegion);
            assert_eq!(origin, KeyOrigin::Assigned);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(provisioner.pool().len(), 1);
    assert!(provisioner.database().is_empty());
    assert_released(&probe);
}

#[test]
fn integration_erased_device_gets_recorded_key_back() {
    let station = station(&["1A2B"]);
    let mut probe = station.device(UID_A);
    station.open().run(&mut probe).unwrap();
    let db_before = station.database();

    // Field return: device wiped, pool restocked.
    probe.mass_erase();
    station.add_key("00FF");
    let mut provisioner = station.open();

    match provisioner.run(&mut probe).unwrap() {
        Outcome::ProgrammedOk {
            key_file, origin, ..
        } => {
            assert_eq!(key_file, key("1A2B"));
            assert_eq!(origin, KeyOrigin::Restored);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(station.database(), db_before);
    assert!(provisioner.pool().contains(&key("00FF")));
    assert!(station.archive_dir().join("1A2B").exists());
    assert_eq!(probe.peek(KEY_ADDR, 2), vec![0xDC, 0xDC]);
    assert_released(&probe);
}

#[test]
fn integration_failed_restore_leaves_store_untouched() {
    let station = station(&["1A2B", "00FF"]);
    let mut probe = station.device(UID_A);
    station.open().run(&mut probe).unwrap();
    let db_before = station.database();

    probe.mass_erase();
    probe.set_faults(SimFaults {
        fail_flash: true,
        ..Default::default()
    });
    let mut provisioner = station.open();

    match provisioner.run(&mut probe).unwrap() {
        Outcome::ProgrammingFailed { origin, state, .. } => {
            assert_eq!(origin, KeyOrigin::Restored);
            assert_eq!(state, SessionState::FlashWrite);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(station.database(), db_before);
    assert_eq!(provisioner.pool().len(), 1);
    assert_released(&probe);
}

#[test]
fn integration_missing_archived_key_is_fatal_before_erase() {
    let station = station(&["00FF"]);
    let mut probe = station.device(UID_A);
    station.open().run(&mut probe).unwrap();

    fs::remove_file(station.archive_dir().join("00FF")).unwrap();
    probe.mass_erase();
    probe.reset_stats();

    let mut provisioner = station.open();
    assert_eq!(provisioner.report().missing_from_archive.len(), 1);
    let err = provisioner.run(&mut probe).unwrap_err();
    assert!(matches!(err, ProvisionError::KeyFile { .. }));
    assert_eq!(probe.stats().write_path_calls(), 0);
    assert_released(&probe);
}

#[test]
fn integration_connect_failure_is_fatal() {
    let station = station(&["1A2B"]);
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);
    probe.set_faults(SimFaults {
        refuse_connect: true,
        ..Default::default()
    });

    let err = provisioner.run(&mut probe).unwrap_err();
    assert!(matches!(err, ProvisionError::Connect(ProbeError::Connect(_))));
    assert_eq!(probe.stats().connects, 0);
    assert_eq!(probe.stats().disconnects, 0);
    assert!(station.key_dir().join("1A2B").exists());
    assert_eq!(provisioner.pool().len(), 1);
}

#[test]
fn integration_probe_error_before_erase_is_fatal() {
    let station = station(&["1A2B"]);
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);
    probe.set_faults(SimFaults {
        fail_read: true,
        ..Default::default()
    });

    match provisioner.run(&mut probe).unwrap_err() {
        ProvisionError::Probe { state, .. } => assert_eq!(state, SessionState::ReadUid),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(probe.stats().write_path_calls(), 0);
    assert_eq!(provisioner.pool().len(), 1);
    assert_released(&probe);
}

#[test]
fn integration_torn_database_blocks_startup() {
    let station = station(&["1A2B"]);
    fs::write(
        &station.config.paths.database,
        "uid,keyfile,timestamp\nAABBCC0000",
    )
    .unwrap();

    let err = Provisioner::open(&station.config).err().unwrap();
    assert!(matches!(err, ProvisionError::CorruptRecord { line: 2, .. }));
}

#[test]
fn integration_missing_key_dir_is_fatal() {
    let station = station(&[]);
    fs::remove_dir(station.key_dir()).unwrap();

    let err = Provisioner::open(&station.config).err().unwrap();
    assert!(matches!(err, ProvisionError::Io { .. }));
}

#[test]
fn integration_startup_creates_archive_and_database() {
    let station = station(&["1A2B"]);
    assert!(!station.archive_dir().exists());

    let provisioner = station.open();
    assert!(station.archive_dir().is_dir());
    assert_eq!(station.database(), "uid,keyfile,timestamp\n");
    assert!(provisioner.report().is_clean());
}

#[test]
fn integration_reconciliation_excludes_assigned_pool_keys() {
    let station = station(&["1A2B", "00FF"]);
    fs::create_dir(station.archive_dir()).unwrap();
    fs::write(station.archive_dir().join("BEEF"), key_blob("BEEF")).unwrap();
    fs::write(
        &station.config.paths.database,
        format!("uid,keyfile,timestamp\n{},1A2B,1700000000\n", UID_A),
    )
    .unwrap();

    let mut provisioner = station.open();
    let report = provisioner.report().clone();
    assert_eq!(report.orphaned_archive, vec![key("BEEF")]);
    assert_eq!(report.pool_conflicts, vec![key("1A2B")]);
    assert!(!provisioner.pool().contains(&key("1A2B")));

    let mut probe = station.device("AABBCC000000000000000002");
    match provisioner.run(&mut probe).unwrap() {
        Outcome::ProgrammedOk { key_file, .. } => assert_eq!(key_file, key("00FF")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn integration_sentinel_without_record_is_reported() {
    let station = station(&["1A2B"]);
    let mut probe = station.device(UID_A);
    probe.poke(KEY_ADDR, &[0xDC, 0xDC]);

    let mut provisioner = station.open();
    let outcome = provisioner.run(&mut probe).unwrap();
    assert_eq!(
        outcome,
        Outcome::AlreadyProgrammed {
            uid: uid(UID_A),
            recorded: false,
            recovered: None,
        }
    );
    assert_eq!(provisioner.pool().len(), 1);
}

#[test]
fn integration_session_trace() {
    let station = station(&["1A2B"]);
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);
    provisioner.run(&mut probe).unwrap();

    let states: Vec<SessionState> = provisioner.transitions().iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            SessionState::Connect,
            SessionState::ResetHalt,
            SessionState::ReadUid,
            SessionState::CheckSentinel,
            SessionState::Lookup,
            SessionState::AssignNew,
            SessionState::EraseRegion,
            SessionState::FlashWrite,
            SessionState::Verify,
            SessionState::Commit,
            SessionState::Disconnect,
        ]
    );
    assert_eq!(provisioner.transitions()[0].from, SessionState::Start);
    assert_eq!(provisioner.state(), SessionState::Disconnect);
}

#[test]
fn integration_interrupted_commit_is_completed_before_next_draw() {
    let station = station(&["1A2B", "00FF"]);
    // Flashed and verified with 00FF, then the station died before archiving.
    let mut device_a = station.device(UID_A);
    device_a.poke(KEY_ADDR, &key_blob("00FF"));

    let mut provisioner = station.open();
    let outcome = provisioner.run(&mut device_a).unwrap();
    assert_eq!(
        outcome,
        Outcome::AlreadyProgrammed {
            uid: uid(UID_A),
            recorded: true,
            recovered: Some(key("00FF")),
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(device_a.stats().write_path_calls(), 0);
    assert_eq!(provisioner.database().get(&uid(UID_A)).unwrap().key_file, key("00FF"));
    assert!(station.archive_dir().join("00FF").exists());
    assert!(!station.key_dir().join("00FF").exists());
    assert!(!provisioner.pool().contains(&key("00FF")));
    assert_released(&device_a);

    let mut device_b = station.device("AABBCC000000000000000002");
    match provisioner.run(&mut device_b).unwrap() {
        Outcome::ProgrammedOk { key_file, .. } => assert_eq!(key_file, key("1A2B")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let len = key_blob("1A2B").len();
    assert_ne!(device_a.peek(KEY_ADDR, len), device_b.peek(KEY_ADDR, len));

    let reloaded = station.open();
    assert_eq!(reloaded.database().len(), 2);
    assert!(reloaded.report().is_clean());
}

#[test]
fn integration_interrupted_commit_after_archive_is_completed() {
    let station = station(&["00FF"]);
    // Archived, then the station died before appending the record.
    fs::create_dir(station.archive_dir()).unwrap();
    fs::write(station.archive_dir().join("1A2B"), key_blob("1A2B")).unwrap();
    let mut probe = station.device(UID_A);
    probe.poke(KEY_ADDR, &key_blob("1A2B"));

    let mut provisioner = station.open();
    assert_eq!(provisioner.report().orphaned_archive, vec![key("1A2B")]);

    match provisioner.run(&mut probe).unwrap() {
        Outcome::AlreadyProgrammed { recovered, .. } => assert_eq!(recovered, Some(key("1A2B"))),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(provisioner.report().orphaned_archive.is_empty());
    assert!(provisioner.pool().contains(&key("00FF")));
    assert!(station.archive_dir().join("1A2B").exists());
    assert!(station.open().report().is_clean());
}

#[test]
fn integration_unusable_drawn_key_stays_in_pool() {
    let station = station(&[]);
    fs::write(station.key_dir().join("1A2B"), b"").unwrap();
    let mut provisioner = station.open();
    let mut probe = station.device(UID_A);

    let err = provisioner.run(&mut probe).unwrap_err();
    assert!(matches!(err, ProvisionError::KeyFile { .. }));
    assert!(provisioner.pool().contains(&key("1A2B")));
    assert_eq!(probe.stats().write_path_calls(), 0);
    assert_released(&probe);
}

#[test]
fn integration_archive_collision_keeps_key_in_pool() {
    let station = station(&["1A2B"]);
    let mut provisioner = station.open();
    fs::write(station.archive_dir().join("1A2B"), key_blob("1A2B")).unwrap();
    let mut probe = station.device(UID_A);

    let err = provisioner.run(&mut probe).unwrap_err();
    assert!(matches!(err, ProvisionError::Io { .. }));
    assert!(provisioner.pool().contains(&key("1A2B")));
    assert_eq!(probe.stats().write_path_calls(), 0);
}

#[test]
fn integration_pool_key_already_archived_is_excluded_at_startup() {
    let station = station(&["0001", "1A2B"]);
    fs::create_dir(station.archive_dir()).unwrap();
    fs::write(station.archive_dir().join("0001"), key_blob("0001")).unwrap();

    let mut provisioner = station.open();
    assert_eq!(provisioner.report().pool_conflicts, vec![key("0001")]);
    assert!(!provisioner.pool().contains(&key("0001")));

    let mut probe = station.device(UID_A);
    match provisioner.run(&mut probe).unwrap() {
        Outcome::ProgrammedOk { key_file, .. } => assert_eq!(key_file, key("1A2B")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
