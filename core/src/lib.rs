//! vmango core library
//!
//! Compute model, libvirt repositories over a per-node connection pool,
//! cloud-init config drives, key and image stores, scripted events and the
//! VM manager that ties them together.

pub mod auth;
pub mod bootstrap;
pub mod command;
pub mod compute;
pub mod config;
pub mod configdrive;
pub mod devices;
pub mod error;
pub mod events;
pub mod keys;
pub mod libvirt;
pub mod manifest;
pub mod model;
pub mod units;

pub use compute::Service;
pub use config::Config;
pub use error::{Context, Error, Result};
pub use keys::Key;
pub use model::*;
pub use units::Size;
