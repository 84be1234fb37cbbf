mod common;

use std::time::Duration;

use common::{Call, FakeCompute, FakeExecutor, Harness, START_COMMAND, fast_config};
use hcp_core::model::ClusterStatus;
use hcp_core::{ClusterStore, HcpError, OrchestratorConfig, PollPolicy};

const SETUP_PATH: &str = "/tmp/hcp-setup.sh";

#[tokio::test]
async fn single_master_cluster_becomes_active() {
    let harness = Harness::new(FakeCompute::new(), FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();
    assert_eq!(view.status, ClusterStatus::Starting);
    assert!(view.nodes.is_empty());

    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);

    let view = harness.store.cluster_view(&view.id).await.unwrap();
    assert_eq!(view.status, ClusterStatus::Active);
    assert_eq!(view.nodes.len(), 1);
    assert_eq!(view.nodes[0].name, "c1-master");
    assert_eq!(view.nodes[0].external_ip.as_deref(), Some("172.24.4.1"));
    assert_eq!(view.service_urls.len(), 2);
    assert_eq!(view.service_urls["jobtracker"], "http://172.24.4.1:50030");
    assert_eq!(view.service_urls["namenode"], "http://172.24.4.1:50070");

    let runs = harness.executor.runs_on("172.24.4.1");
    assert_eq!(runs.last().map(String::as_str), Some(START_COMMAND));
    let uploads = harness.executor.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].1.contains("hdfs://c1-master:8020"));
    assert!(uploads[0].1.contains("export HADOOP_JOBTRACKER_OPTS=\"-Xmx896m\""));
    assert_eq!(harness.executor.open_sessions(), 0);
}

#[tokio::test]
async fn master_and_workers_get_their_scripts() {
    let harness = Harness::new(FakeCompute::new(), FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(
            harness.ctx(),
            harness.request("c1", &[("jt_nn.small", 1), ("tt_dn.small", 2)]),
        )
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);

    let mut names = harness.compute.names();
    names.sort();
    assert_eq!(names, ["c1-1", "c1-2", "c1-master"]);

    let view = harness.store.cluster_view(&view.id).await.unwrap();
    assert_eq!(view.status, ClusterStatus::Active);
    assert_eq!(view.nodes.len(), 3);

    let master_ip = view
        .nodes
        .iter()
        .find(|n| n.name == "c1-master")
        .and_then(|n| n.external_ip.clone())
        .unwrap();
    for (host, script) in harness.executor.uploads() {
        assert!(script.contains("c1-master:8021"));
        if host == master_ip {
            assert!(script.contains("namenode -format"));
            assert!(script.contains("c1-1\nc1-2"));
        } else {
            assert!(!script.contains("namenode -format"));
            assert!(script.contains("HADOOP_TASKTRACKER_OPTS"));
        }
    }

    let start_hosts: Vec<String> = harness
        .executor
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Run { host, command } if command == START_COMMAND => Some(host),
            _ => None,
        })
        .collect();
    assert_eq!(start_hosts, [master_ip]);
}

#[tokio::test]
async fn transient_connection_failures_are_retried() {
    let executor = FakeExecutor::refusing_first(3);
    let harness = Harness::new(FakeCompute::new(), executor, fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(
        harness.store.get_cluster(&view.id).await.unwrap().status,
        ClusterStatus::Active
    );
}

#[tokio::test]
async fn missing_flavor_fails_before_launch() {
    let mut compute = FakeCompute::new();
    compute.flavors.clear();
    let harness = Harness::new(compute, FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    assert!(matches!(outcome.result, Err(HcpError::Planning(_))));
    assert!(harness.compute.created().is_empty());
    let cluster = harness.store.get_cluster(&view.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.unwrap().contains("flavor"));
}

#[tokio::test]
async fn missing_image_fails_before_launch() {
    let mut compute = FakeCompute::new();
    compute.images.clear();
    let harness = Harness::new(compute, FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    assert!(matches!(outcome.result, Err(HcpError::Planning(_))));
    assert!(harness.compute.created().is_empty());
    assert_eq!(
        harness.store.get_cluster(&view.id).await.unwrap().status,
        ClusterStatus::Error
    );
}

#[tokio::test]
async fn two_master_plan_rejected_before_launch() {
    let harness = Harness::new(FakeCompute::new(), FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 2)]))
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    assert!(matches!(outcome.result, Err(HcpError::Planning(_))));
    assert!(harness.compute.created().is_empty());
}

#[tokio::test]
async fn failing_script_marks_error_and_keeps_nodes() {
    let mut executor = FakeExecutor::default();
    executor.fail_everywhere.insert(SETUP_PATH.to_string());
    let harness = Harness::new(FakeCompute::new(), executor, fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(
            harness.ctx(),
            harness.request("c1", &[("jt_nn.small", 1), ("tt_dn.small", 1)]),
        )
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    assert!(matches!(outcome.result, Err(HcpError::Provisioning(_))));
    let view = harness.store.cluster_view(&view.id).await.unwrap();
    assert_eq!(view.status, ClusterStatus::Error);
    assert!(view.status_description.unwrap().contains("exited with 1"));
    assert_eq!(view.nodes.len(), 2);
    assert!(view.service_urls.is_empty());
    assert!(harness.compute.deleted().is_empty());
    assert!(
        harness
            .executor
            .calls()
            .iter()
            .all(|c| !matches!(c, Call::Run { command, .. } if command == START_COMMAND))
    );
}

#[tokio::test]
async fn failing_script_terminates_instances_when_configured() {
    let mut executor = FakeExecutor::default();
    executor.fail_everywhere.insert(SETUP_PATH.to_string());
    let config = OrchestratorConfig {
        terminate_on_failure: true,
        ..fast_config()
    };
    let harness = Harness::new(FakeCompute::new(), executor, config);
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(
            harness.ctx(),
            harness.request("c1", &[("jt_nn.small", 1), ("tt_dn.small", 1)]),
        )
        .await
        .unwrap();
    harness.manager.wait(&view.id).await.unwrap().unwrap();

    let view = harness.store.cluster_view(&view.id).await.unwrap();
    assert_eq!(view.status, ClusterStatus::Error);
    assert!(view.nodes.is_empty());
    let mut created = harness.compute.created();
    let mut deleted = harness.compute.deleted();
    created.sort();
    deleted.sort();
    assert_eq!(created, deleted);
}

#[tokio::test]
async fn failing_start_command_marks_error() {
    let mut executor = FakeExecutor::default();
    executor.fail_everywhere.insert(START_COMMAND.to_string());
    let harness = Harness::new(FakeCompute::new(), executor, fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    assert!(outcome.result.is_err());
    let cluster = harness.store.get_cluster(&view.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.unwrap().contains("starting services"));
}

#[tokio::test]
async fn readiness_timeout_marks_error() {
    let compute = FakeCompute::new().without_addresses();
    let config = OrchestratorConfig {
        poll: PollPolicy {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
            backoff: 1.5,
            timeout: Duration::from_millis(100),
        },
        ..fast_config()
    };
    let harness = Harness::new(compute, FakeExecutor::default(), config);
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();
    let outcome = harness.manager.wait(&view.id).await.unwrap().unwrap();

    match &outcome.result {
        Err(HcpError::ReadinessTimeout { pending, .. }) => assert_eq!(pending, &["c1-master"]),
        other => panic!("unexpected {other:?}"),
    }
    let view = harness.store.cluster_view(&view.id).await.unwrap();
    assert_eq!(view.status, ClusterStatus::Error);
    assert!(view.status_description.unwrap().contains("c1-master"));
    // left registered for manual reconciliation
    assert_eq!(view.nodes.len(), 1);
}

#[tokio::test]
async fn delete_removes_cluster_nodes_and_urls() {
    let harness = Harness::new(FakeCompute::new(), FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(
            harness.ctx(),
            harness.request("c1", &[("jt_nn.small", 1), ("tt_dn.small", 1)]),
        )
        .await
        .unwrap();
    harness.manager.wait(&view.id).await.unwrap().unwrap();

    let teardown = harness
        .manager
        .delete_cluster(harness.ctx(), &view.id)
        .await
        .unwrap();
    teardown.await.unwrap().unwrap();

    assert!(harness.store.get_cluster(&view.id).await.unwrap_err().is_not_found());
    assert!(harness.store.cluster_view(&view.id).await.unwrap_err().is_not_found());
    assert!(harness.store.list_service_urls(&view.id).await.unwrap_err().is_not_found());
    let mut deleted = harness.compute.deleted();
    deleted.sort();
    assert_eq!(deleted, ["vm-1", "vm-2"]);
}

#[tokio::test]
async fn delete_sets_stopping_before_teardown() {
    let compute = FakeCompute::new().without_addresses();
    let harness = Harness::new(compute, FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("jt_nn.small", 1)]))
        .await
        .unwrap();

    let teardown = harness
        .manager
        .delete_cluster(harness.ctx(), &view.id)
        .await
        .unwrap();
    assert_eq!(
        harness.store.get_cluster(&view.id).await.unwrap().status,
        ClusterStatus::Stopping
    );
    teardown.await.unwrap().unwrap();
    assert!(harness.store.get_cluster(&view.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_during_provisioning_cancels_and_terminates() {
    let compute = FakeCompute::new().without_addresses();
    let harness = Harness::new(compute, FakeExecutor::default(), fast_config());
    harness.seed().await;

    let view = harness
        .manager
        .create_cluster(
            harness.ctx(),
            harness.request("c1", &[("jt_nn.small", 1), ("tt_dn.small", 2)]),
        )
        .await
        .unwrap();
    while harness.compute.created().len() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let teardown = harness
        .manager
        .delete_cluster(harness.ctx(), &view.id)
        .await
        .unwrap();
    let (outcome, torn_down) = tokio::join!(harness.manager.wait(&view.id), teardown);
    torn_down.unwrap().unwrap();

    let outcome = outcome.unwrap().unwrap();
    assert!(matches!(outcome.result, Err(HcpError::Cancelled)));
    assert!(harness.store.get_cluster(&view.id).await.unwrap_err().is_not_found());

    let mut created = harness.compute.created();
    let mut deleted = harness.compute.deleted();
    created.sort();
    deleted.sort();
    assert_eq!(created, deleted);
}

#[tokio::test]
async fn unknown_cluster_delete_is_not_found() {
    let harness = Harness::new(FakeCompute::new(), FakeExecutor::default(), fast_config());
    let err = harness
        .manager
        .delete_cluster(harness.ctx(), "missing")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn unknown_template_rejected_on_create() {
    let harness = Harness::new(FakeCompute::new(), FakeExecutor::default(), fast_config());
    harness.seed().await;

    let err = harness
        .manager
        .create_cluster(harness.ctx(), harness.request("c1", &[("nope", 1)]))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(harness.store.list_clusters(None).await.unwrap().is_empty());
}
