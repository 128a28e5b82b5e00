//! Unit tests for the deployer

mod common;
mod test_config;
mod test_fsm;
mod test_installer;
mod test_orchestrator;
mod test_owner;
mod test_rollback;
mod test_services;
