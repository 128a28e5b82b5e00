//! Thin async wrappers over files and directories

pub mod dir;
pub mod file;
pub mod owner;
