//! Automatic mirroring of USB storage devices.
//!
//! [`core::Classifier`] picks the mounted USB filesystems out of the host's
//! block-device tree; [`core::Orchestrator`] polls it and mirrors every
//! device it has not backed up yet.

pub mod adapters;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod logging;
