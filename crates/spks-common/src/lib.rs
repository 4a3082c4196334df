//! # spks-common
//!
//! Shared building blocks for the SPKS keyserver:
//! - server configuration (YAML file + `SPKS_*` environment overlay)
//! - the HKP `Status` outcome type with its HTTP rendering rules
//! - OpenPGP keyring helpers built on sequoia

pub mod config;
pub mod keyring;
pub mod status;
