//! FSM unit tests

use velodeploy::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use velodeploy::deploy::record::{DeploymentRecord, Outcome, Warning};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Init);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_stages_cannot_be_skipped() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Begin).unwrap();

    assert!(fsm.process(DeploymentEvent::Configured).is_err());
    assert!(fsm.process(DeploymentEvent::Verified).is_err());
    assert_eq!(fsm.state(), DeploymentState::Preflight);
}

#[test]
fn test_fsm_rollback_only_after_failure() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Begin).unwrap();
    assert!(fsm.process(DeploymentEvent::RolledBack).is_err());

    fsm.process(DeploymentEvent::PreflightPassed).unwrap();
    fsm.process(DeploymentEvent::Downloaded).unwrap();
    fsm.process(DeploymentEvent::Fail("config show rejected".to_string()))
        .unwrap();
    fsm.process(DeploymentEvent::RolledBack).unwrap();

    assert_eq!(fsm.state(), DeploymentState::RolledBack);
    assert!(fsm.state().is_terminal());
    assert_eq!(fsm.error(), Some("config show rejected"));
}

#[test]
fn test_fsm_ready_is_terminal() {
    let mut fsm = DeploymentFsm::new();
    for event in [
        DeploymentEvent::Begin,
        DeploymentEvent::PreflightPassed,
        DeploymentEvent::Downloaded,
        DeploymentEvent::Configured,
        DeploymentEvent::Provisioned,
        DeploymentEvent::ServiceStarted,
        DeploymentEvent::Verified,
    ] {
        fsm.process(event).unwrap();
    }

    assert!(fsm.process(DeploymentEvent::Fail("late".to_string())).is_err());
    assert_eq!(fsm.state(), DeploymentState::Ready);
}

#[test]
fn test_record_warnings_do_not_fail() {
    let mut record = DeploymentRecord::new("staging", "/tmp/server.config.yaml", None);
    for event in [
        DeploymentEvent::Begin,
        DeploymentEvent::PreflightPassed,
        DeploymentEvent::Downloaded,
        DeploymentEvent::Configured,
        DeploymentEvent::Provisioned,
        DeploymentEvent::ServiceStarted,
        DeploymentEvent::Verified,
    ] {
        record.advance(event).unwrap();
    }
    record.warn(Warning::Firewall("ufw not installed".to_string()));

    assert_eq!(record.status, DeploymentState::Ready);
    assert_eq!(record.outcome(), Outcome::SucceededWithWarnings);

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["status"], "READY");
    assert_eq!(json["warnings"][0]["kind"], "firewall");
}
