//! CubeFS Common - Shared types and utilities
//!
//! This crate provides the error type, configuration structures, extent
//! geometry constants and wire types shared by the data node and the
//! flash node.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::{DataNodeConfig, FlashNodeConfig, PartitionConfig, PeerConfig};
pub use error::{Error, Result};
pub use types::*;
