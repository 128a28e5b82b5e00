//! Deployment module

pub mod firewall;
pub mod fsm;
pub mod lock;
pub mod orchestrator;
pub mod preflight;
pub mod profile;
pub mod record;
pub mod rollback;
