//! On-disk layout, settings and configuration backups

pub mod backup;
pub mod layout;
pub mod settings;
