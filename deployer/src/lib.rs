//! velodeploy library
//!
//! Installs a Velociraptor server from its release feed, generates its
//! configuration, registers it with the platform service manager and waits
//! until it serves.

pub mod config;
pub mod deploy;
pub mod errors;
pub mod exec;
pub mod filesys;
pub mod installer;
pub mod logs;
pub mod managed;
pub mod process;
pub mod provision;
pub mod release;
pub mod services;
pub mod storage;
pub mod utils;
