//! Core functionality for the keyburn key provisioning station.
//!
//! This crate provides the identifier types, configuration, error type and
//! logging setup shared by the provisioning workflow.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{MemoryMap, PathConfig, PoolConfig, PoolSelection, ProbeConfig, ProvisionConfig};
pub use error::{CoreError, Result};
pub use types::{unix_timestamp, KeyFileName, Uid, KEY_NAME_LEN, UID_LEN};
