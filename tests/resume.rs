// ABOUTME: Integration tests for resuming failed or interrupted launches.
// ABOUTME: Committed resources are reused; untracked tagged resources are adopted, vanished ones replaced.

mod support;

use shipyard::controller::ControllerError;
use shipyard::deploy::DeployErrorKind;
use shipyard::diagnostics::{Diagnostics, WarningKind};
use shipyard::provider::{MANAGED_TAG, NodeStatus, ProviderError, service_tag};
use shipyard::registry::RegistryError;
use shipyard::state::ServiceStatus;
use shipyard::types::ServiceName;
use std::time::Duration;
use support::*;

fn web() -> ServiceName {
    ServiceName::new("web").unwrap()
}

fn deploy_kind(err: &ControllerError) -> DeployErrorKind {
    match err {
        ControllerError::Deploy(e) => e.kind(),
        other => panic!("expected a deploy error, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_launch_resumes_on_same_node() {
    let h = Harness::new();
    h.registry.fail_next_build(RegistryError::BuildFailed {
        image: "registry.example.com/acme/web:latest".into(),
        message: "syntax error in Dockerfile".into(),
    });

    let mut diag = Diagnostics::default();
    let err = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap_err();
    assert_eq!(deploy_kind(&err), DeployErrorKind::Registry);

    let failed = h.store().require(&web()).unwrap();
    assert_eq!(failed.status, ServiceStatus::Failed);
    assert!(failed.node().unwrap().ready, "node progress is kept");
    assert!(failed.last_error.as_ref().unwrap().contains("syntax error"));

    let record = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.node().unwrap().id, failed.node().unwrap().id);
    assert_eq!(h.provider.count("create_node"), 1);
    assert_eq!(h.registry.builds().len(), 2);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn interrupted_launch_resumes_without_duplicate_node() {
    let h = Harness::new();
    let _gate = h.provider.block_next("describe_node");

    let mut diag = Diagnostics::default();
    let interrupted = tokio::time::timeout(
        Duration::from_millis(200),
        h.controller
            .launch(web(), spec(&h.context()), false, &mut diag),
    )
    .await;
    assert!(interrupted.is_err(), "launch should still be waiting for the node");

    let mid = h.store().require(&web()).unwrap();
    assert_eq!(mid.status, ServiceStatus::Provisioning);
    assert_eq!(mid.nodes.len(), 1);
    assert!(!mid.node().unwrap().ready);

    let record = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .expect("the dropped run released its lock");

    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.node().unwrap().id, mid.node().unwrap().id);
    assert_eq!(h.provider.count("create_node"), 1);
}

#[tokio::test]
async fn untracked_tagged_node_is_adopted() {
    let h = Harness::new();
    let orphan = h.provider.seed_node(
        "web",
        vec![MANAGED_TAG.to_string(), service_tag("web")],
        NodeStatus::Provisioning,
    );

    let mut diag = Diagnostics::default();
    let record = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.node().unwrap().id, orphan);
    assert_eq!(h.provider.count("create_node"), 0);
}

#[tokio::test]
async fn node_deleted_behind_our_back_is_replaced() {
    let h = Harness::new();
    let mut diag = Diagnostics::default();
    let first = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();
    h.provider.forget_node(&first.node().unwrap().id);

    let record = h
        .controller
        .redeploy(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.status, ServiceStatus::Running);
    assert_ne!(record.node().unwrap().id, first.node().unwrap().id);
    assert_eq!(h.provider.count("create_node"), 2);
}

#[tokio::test]
async fn node_that_never_boots_times_out() {
    let h = Harness::with_provider(FakeProvider::new().with_boot_polls(u32::MAX));
    let mut diag = Diagnostics::default();

    let err = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap_err();

    assert_eq!(deploy_kind(&err), DeployErrorKind::Timeout);
    let record = h.store().require(&web()).unwrap();
    assert_eq!(record.status, ServiceStatus::Failed);
    assert!(record.last_error.unwrap().contains("provisioning"));
}

#[tokio::test]
async fn node_in_error_state_fails_fast() {
    let h = Harness::with_provider(FakeProvider::new().with_failing_boots());
    let mut diag = Diagnostics::default();

    let err = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap_err();

    assert_eq!(deploy_kind(&err), DeployErrorKind::ResourceFailed);
    assert_eq!(h.provider.count("describe_node"), 1);
}

#[tokio::test]
async fn relaunch_replaces_node_in_error_state() {
    let h = Harness::with_provider(FakeProvider::new().with_failing_first_boots(1));
    let mut diag = Diagnostics::default();
    h.controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap_err();
    let failed = h.store().require(&web()).unwrap().nodes[0].id.clone();

    let record = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(h.provider.count("create_node"), 2);
    assert_eq!(h.provider.count("delete_node"), 1);
    assert_eq!(record.nodes.len(), 1);
    assert_ne!(record.nodes[0].id, failed);
    assert!(h.provider.nodes().iter().all(|n| n.id != failed));
    assert!(diag.warnings().is_empty());
}

#[tokio::test]
async fn undeletable_failed_node_is_warned_about_and_left_behind() {
    let h = Harness::with_provider(FakeProvider::new().with_failing_first_boots(1));
    let mut diag = Diagnostics::default();
    h.controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap_err();
    h.provider.fail_next(
        "delete_node",
        ProviderError::Rejected {
            status: 422,
            message: "droplet is locked".into(),
        },
    );

    let mut diag = Diagnostics::default();
    let record = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(h.provider.nodes().len(), 2);
    assert_eq!(diag.warnings().len(), 1);
    assert_eq!(diag.warnings()[0].kind, WarningKind::ResourceCleanup);
    assert!(diag.warnings()[0].message.contains("droplet is locked"));
}

#[tokio::test]
async fn transient_provider_errors_are_retried() {
    let h = Harness::new();
    h.provider.fail_next("create_node", ProviderError::RateLimited);
    h.provider
        .fail_next("create_node", ProviderError::Unavailable("502 Bad Gateway".into()));

    let mut diag = Diagnostics::default();
    let record = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap();

    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(h.provider.count("create_node"), 3);
    assert_eq!(h.provider.nodes().len(), 1);
}

#[tokio::test]
async fn rejected_request_is_not_retried() {
    let h = Harness::new();
    h.provider.fail_next(
        "create_node",
        ProviderError::Rejected {
            status: 422,
            message: "size is not available in this region".into(),
        },
    );

    let mut diag = Diagnostics::default();
    let err = h
        .controller
        .launch(web(), spec(&h.context()), false, &mut diag)
        .await
        .unwrap_err();

    assert_eq!(deploy_kind(&err), DeployErrorKind::Provider);
    assert_eq!(h.provider.count("create_node"), 1);
    let record = h.store().require(&web()).unwrap();
    assert_eq!(record.status, ServiceStatus::Failed);
    assert!(record.nodes.is_empty());
}
