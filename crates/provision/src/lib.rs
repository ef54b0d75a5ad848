//! Manufacturing key provisioning.
//!
//! Assigns exactly one key file from a pool to each device, identified by
//! its silicon UID, programs it through a debug probe and records the
//! assignment in an append-only database. Re-running against a device that
//! is already on record restores the same key instead of drawing a new one.
//!
//! # Example
//! ```no_run
//! use keyburn_core::ProvisionConfig;
//! use keyburn_provision::{OpenOcdProbe, Provisioner};
//!
//! let config = ProvisionConfig::default();
//! let mut provisioner = Provisioner::open(&config)?;
//! let mut probe = OpenOcdProbe::new(config.probe.clone());
//! let outcome = provisioner.run(&mut probe)?;
//! println!("{}", outcome.status_line());
//! # Ok::<(), keyburn_provision::ProvisionError>(())
//! ```

pub mod database;
pub mod error;
pub mod layout;
pub mod openocd;
pub mod pool;
pub mod probe;
pub mod provisioner;
pub mod reconcile;
pub mod sim;

pub use database::{ProvisioningDatabase, ProvisioningRecord, RowOutcome, TornTail};
pub use error::{ProvisionError, Result};
pub use layout::{round_to_sector, FlashLayout};
pub use openocd::{OpenOcdLink, OpenOcdProbe};
pub use pool::{archive, list_archived_keys, list_unused_keys, KeyPool};
pub use probe::{DebugProbe, ProbeError, ProbeLink, ProbeSession};
pub use provisioner::{prepare_store, KeyOrigin, Outcome, Provisioner, SessionState, StateTransition};
pub use reconcile::{reconcile, ReconcileReport};
pub use sim::{SimFaults, SimLink, SimProbe, SimStats};
