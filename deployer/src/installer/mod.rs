//! Server binary installation

pub mod artifact;
