//! Direct process launches and readiness polling

pub mod readiness;
pub mod supervisor;
