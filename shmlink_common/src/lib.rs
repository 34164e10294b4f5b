//! shmlink Common Library
//!
//! Shared constants and configuration loading for all shmlink crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment layout and handshake protocol constants
//! - [`config`] - Configuration loading traits and types
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! shmlink = { package = "shmlink_common", path = "../shmlink_common" }
//! ```

pub mod config;
pub mod consts;
