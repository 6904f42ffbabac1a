// ABOUTME: Integration tests for redeploy failure handling.
// ABOUTME: A failed redeploy restores the previous container, or reports when it cannot.

mod support;

use shipyard::controller::ControllerError;
use shipyard::deploy::{DeployError, DeployErrorKind, Step};
use shipyard::diagnostics::Diagnostics;
use shipyard::registry::RegistryError;
use shipyard::state::{ServiceRecord, ServiceStatus};
use shipyard::types::{ContainerId, ServiceName};
use std::time::Duration;
use support::*;

fn web() -> ServiceName {
    ServiceName::new("web").unwrap()
}

async fn running(h: &Harness) -> ServiceRecord {
    let mut diag = Diagnostics::default();
    h.controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap()
}

fn deploy_error(err: ControllerError) -> DeployError {
    match err {
        ControllerError::Deploy(e) => e,
        other => panic!("expected a deploy error, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_readiness_restores_previous_container() {
    let h = Harness::new();
    let before = running(&h).await;
    h.provider
        .respond(" inspect ", output(0, "exited\n", ""), Some(1));
    let mut changed = spec(&h.context());
    changed.env.insert("FEATURE_FLAG".into(), "on".into());

    let mut diag = Diagnostics::default();
    let err = h
        .controller
        .redeploy(web(), changed, false, &mut diag)
        .await
        .unwrap_err();

    let err = deploy_error(err);
    assert_eq!(err.kind(), DeployErrorKind::RolledBack);
    assert_eq!(err.step(), Some(Step::CheckReadiness));
    assert!(err.to_string().contains(&before.image.as_ref().unwrap().to_string()));

    let commands = h.provider.commands();
    let restore: Vec<&String> = commands
        .iter()
        .skip_while(|c| !c.contains(" logs "))
        .collect();
    assert!(restore.iter().any(|c| *c == "docker rename 'web-old' 'web'"));
    assert!(restore.iter().any(|c| *c == "docker start 'web'"));

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.image, before.image);
    assert_eq!(after.previous_image, before.previous_image);
    assert_eq!(after.container, before.container);
    assert_eq!(after.spec, before.spec);
    assert!(after.rollback.is_none());

    let last_error = after.last_error.unwrap();
    assert!(last_error.contains("container exited"));
    assert!(last_error.contains("listening on :8000"), "captured logs recorded");
}

#[tokio::test]
async fn build_failure_leaves_running_container_alone() {
    let h = Harness::new();
    let before = running(&h).await;
    h.registry.fail_next_build(RegistryError::BuildFailed {
        image: "registry.example.com/acme/web:latest".into(),
        message: "COPY failed: no such file".into(),
    });
    let commands_before = h.provider.commands().len();

    let mut diag = Diagnostics::default();
    let err = deploy_error(
        h.controller
            .redeploy(web(), spec(&h.context()), false, &mut diag)
            .await
            .unwrap_err(),
    );

    assert_eq!(err.kind(), DeployErrorKind::RolledBack);
    assert_eq!(err.step(), Some(Step::BuildImage));
    assert_eq!(h.provider.commands().len(), commands_before);

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.image, before.image);
    assert!(after.last_error.unwrap().contains("COPY failed"));
}

#[tokio::test]
async fn replacement_that_cannot_start_is_rolled_back() {
    let h = Harness::new();
    let before = running(&h).await;
    h.provider.respond(
        " run -d ",
        output(125, "", "port is already allocated"),
        Some(1),
    );

    let mut diag = Diagnostics::default();
    let err = deploy_error(
        h.controller
            .redeploy(web(), spec(&h.context()), false, &mut diag)
            .await
            .unwrap_err(),
    );

    assert_eq!(err.kind(), DeployErrorKind::RolledBack);
    assert_eq!(err.step(), Some(Step::ReplaceContainer));
    assert!(h.provider.ran("docker rename 'web-old' 'web'"));

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.container, before.container);
}

#[tokio::test]
async fn failed_restore_marks_service_failed() {
    let h = Harness::new();
    running(&h).await;
    h.provider
        .respond(" inspect ", output(0, "exited\n", ""), Some(1));
    h.provider
        .respond("docker start 'web'", output(1, "", "No such container: web"), None);

    let mut diag = Diagnostics::default();
    let err = deploy_error(
        h.controller
            .redeploy(web(), spec(&h.context()), false, &mut diag)
            .await
            .unwrap_err(),
    );

    assert_eq!(err.kind(), DeployErrorKind::RollbackFailed);

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Failed);
    assert!(after.last_error.unwrap().contains("rollback failed"));
}

#[tokio::test]
async fn retire_failure_is_only_a_warning() {
    let h = Harness::new();
    running(&h).await;
    h.provider.respond(
        "docker rm -f 'web-old'",
        output(1, "", "device or resource busy"),
        None,
    );

    let mut diag = Diagnostics::default();
    let record = h
        .controller
        .redeploy(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(diag.warnings().len(), 1);
    assert!(diag.warnings()[0].message.contains("device or resource busy"));
}

/// Run a redeploy until it parks on its first remote command, then abandon
/// it the way a killed process would. The new image is committed by then.
async fn interrupt_redeploy(h: &Harness) -> ServiceRecord {
    let _gate = h.provider.block_next("exec_remote");
    let mut diag = Diagnostics::default();
    let redeploy = h
        .controller
        .redeploy(web(), spec(&h.context()), false, &mut diag);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), redeploy)
            .await
            .is_err()
    );
    h.store().require(&web()).unwrap()
}

fn commands_since(h: &Harness, from: usize) -> Vec<String> {
    h.provider.commands().split_off(from)
}

fn before_readiness(commands: &[String]) -> &[String] {
    let end = commands
        .iter()
        .position(|c| c.contains("State.Status"))
        .expect("readiness was checked");
    &commands[..end]
}

#[tokio::test]
async fn interrupted_redeploy_resumes_swap_and_rolls_back() {
    let h = Harness::new();
    let before = running(&h).await;

    let stuck = interrupt_redeploy(&h).await;
    assert_eq!(stuck.status, ServiceStatus::Starting);
    assert_ne!(stuck.image, before.image);
    assert_eq!(stuck.previous_image, before.image);
    assert!(stuck.rollback.is_some());

    let from = h.provider.commands().len();
    h.provider
        .respond("State.Status", output(0, "exited\n", ""), Some(1));
    let mut diag = Diagnostics::default();
    let err = deploy_error(
        h.controller
            .redeploy(web(), spec(&h.context()), false, &mut diag)
            .await
            .unwrap_err(),
    );
    assert_eq!(err.kind(), DeployErrorKind::RolledBack);
    assert_eq!(err.step(), Some(Step::CheckReadiness));

    let commands = commands_since(&h, from);
    let swap = before_readiness(&commands);
    assert!(swap.iter().any(|c| c == "docker stop 'web'"));
    assert!(swap.iter().any(|c| c == "docker rename 'web' 'web-old'"));
    assert!(!swap.iter().any(|c| c.starts_with("docker rm -f 'web' ")));
    assert!(commands.iter().any(|c| c == "docker rename 'web-old' 'web'"));
    assert_eq!(h.registry.builds().len(), 2, "resumed without rebuilding");

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.image, before.image);
    assert_eq!(after.previous_image, before.previous_image);
    assert_eq!(after.container, before.container);
    assert!(after.rollback.is_none());
}

#[tokio::test]
async fn resumed_swap_keeps_container_already_set_aside() {
    let h = Harness::new();
    let before = running(&h).await;
    interrupt_redeploy(&h).await;

    // The interrupted run had renamed the old container before it died.
    let from = h.provider.commands().len();
    h.provider
        .respond("{{.Name}}", output(0, "/web-old\n", ""), None);
    h.provider
        .respond("State.Status", output(0, "exited\n", ""), Some(1));
    let mut diag = Diagnostics::default();
    let err = deploy_error(
        h.controller
            .redeploy(web(), spec(&h.context()), false, &mut diag)
            .await
            .unwrap_err(),
    );
    assert_eq!(err.kind(), DeployErrorKind::RolledBack);

    let commands = commands_since(&h, from);
    let swap = before_readiness(&commands);
    assert!(swap.iter().any(|c| c.starts_with("docker rm -f 'web' ")));
    assert!(!swap.iter().any(|c| c.contains("'web-old'") && c.contains(" rm ")));
    assert!(!swap.iter().any(|c| c == "docker stop 'web'"));
    assert!(commands.iter().any(|c| c == "docker rename 'web-old' 'web'"));
    assert!(commands.iter().any(|c| c == "docker start 'web'"));

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.image, before.image);
    assert_eq!(after.container, before.container);
}

#[tokio::test]
async fn rollback_starts_previous_image_when_its_container_is_gone() {
    let h = Harness::new();
    let before = running(&h).await;
    interrupt_redeploy(&h).await;

    h.provider.respond(
        "{{.Name}}",
        output(1, "", "Error: No such object: c0ffee0001"),
        None,
    );
    h.provider.respond(
        "docker stop 'web'",
        output(1, "", "No such container: web"),
        Some(1),
    );
    h.provider
        .respond("State.Status", output(0, "exited\n", ""), Some(1));
    let mut diag = Diagnostics::default();
    let err = deploy_error(
        h.controller
            .redeploy(web(), spec(&h.context()), false, &mut diag)
            .await
            .unwrap_err(),
    );
    assert_eq!(err.kind(), DeployErrorKind::RolledBack);

    let previous = before.image.as_ref().unwrap().to_string();
    let last_run = h
        .provider
        .commands()
        .into_iter()
        .filter(|c| c.contains(" run -d "))
        .last()
        .unwrap();
    assert!(last_run.contains(&previous));

    let after = h.store().require(&web()).unwrap();
    assert_eq!(after.status, ServiceStatus::Running);
    assert_eq!(after.image, before.image);
    assert_ne!(after.container, before.container);
    assert_eq!(after.container, Some(ContainerId::new("c0ffee0003")));
}
