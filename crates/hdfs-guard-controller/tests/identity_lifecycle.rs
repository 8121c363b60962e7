//! 身份生命周期：供应、吊销、扩缩容与证书名称绑定

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{Harness, REALM, SERVICE};
use hdfs_guard_common::{Error, Principal, Role, TaskEvent, TaskIdentity};
use hdfs_guard_controller::ca::{CertificateAuthority, SelfSignedCa};
use hdfs_guard_controller::identity::{BindingState, PrincipalRegistry, CERT_FILE};
use hdfs_guard_controller::kdc::KdcClient;
use hdfs_guard_controller::tls::{trial_handshake, verify_common_name};

#[tokio::test]
async fn test_provision_revoke_provision_round_trip() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let provisioner = harness.controller.provisioner();
    let principal = Principal::client("alice", REALM);

    let first = provisioner.provision(&principal).await.unwrap();
    provisioner.revoke(&principal).await.unwrap();
    assert!(!harness.kdc.contains(&principal.name()).await);
    // 旧 keytab 已无法认证
    assert!(harness
        .kdc
        .authenticate(&principal.name(), first.bytes())
        .await
        .is_err());

    let second = provisioner.provision(&principal).await.unwrap();
    harness
        .kdc
        .authenticate(&principal.name(), second.bytes())
        .await
        .unwrap();
    assert_eq!(second.principal(), first.principal());
}

#[tokio::test]
async fn test_provision_is_idempotent() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let provisioner = harness.controller.provisioner();
    let principal = Principal::client("bob", REALM);

    let first = provisioner.provision(&principal).await.unwrap();
    let second = provisioner.provision(&principal).await.unwrap();
    assert_eq!(first, second);
    harness
        .kdc
        .authenticate(&principal.name(), first.bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_scale_up_adds_and_scale_down_removes_only_decommissioned() {
    let harness = Harness::new();
    let topology = common::topology();
    harness.controller.apply_topology(topology.clone()).await.unwrap();
    harness.start_all().await;

    let before = harness.controller.principals().await;
    let kvno_of = |name: String| {
        let kdc = harness.kdc.clone();
        async move { kdc.kvno(&name).await }
    };
    let sibling = "hdfs/data-1-node.hdfs@LOCAL".to_string();
    let sibling_kvno = kvno_of(sibling.clone()).await;

    // 扩容
    let scaled_up = topology.scaled(Role::Data, 5);
    let diff = harness.controller.apply_topology(scaled_up.clone()).await.unwrap();
    assert!(diff.removed.is_empty());
    assert_eq!(diff.added.len(), 4);
    let after_up = harness.controller.principals().await;
    assert!(after_up.is_superset(&before));
    assert_eq!(kvno_of(sibling.clone()).await, sibling_kvno);

    let new_task = TaskIdentity::new(SERVICE, Role::Data, 4);
    assert_eq!(harness.start(&new_task).await, BindingState::Ready);

    // 缩容到 2 个 data 节点
    let scaled_down = scaled_up.scaled(Role::Data, 2);
    let diff = harness.controller.apply_topology(scaled_down).await.unwrap();
    let removed: BTreeSet<String> = diff.removed.iter().map(Principal::name).collect();
    let expected: BTreeSet<String> = (2..5)
        .flat_map(|i| {
            ["hdfs", "HTTP"]
                .into_iter()
                .map(move |p| format!("{}/data-{}-node.hdfs@LOCAL", p, i))
        })
        .collect();
    assert_eq!(removed, expected);

    for name in &expected {
        assert!(!harness.kdc.contains(name).await, "{}", name);
    }
    assert!(harness.controller.state(&new_task.task_id).await.is_none());
    assert!(harness
        .controller
        .issuer()
        .current(&new_task.dns_name())
        .await
        .is_none());

    // 未被缩容的兄弟节点不受影响
    assert_eq!(kvno_of(sibling).await, sibling_kvno);
    assert_eq!(
        harness.controller.state("data-1-node").await,
        Some(BindingState::Ready)
    );
}

#[tokio::test]
async fn test_derive_is_deterministic() {
    let topology = common::topology();
    let a = PrincipalRegistry::derive(&topology).unwrap();
    let b = PrincipalRegistry::derive(&topology).unwrap();
    assert_eq!(a, b);
    // 8 个节点 × 2 个 primary + 3 个客户端
    assert_eq!(a.len(), 19);
}

#[tokio::test]
async fn test_certificate_common_name_is_task_dns_name() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    harness.start_all().await;

    let topology = harness.controller.topology().await.unwrap();
    let ca_bundle = harness.controller.issuer().ca_bundle().await.unwrap();
    for task in topology.tasks() {
        let cert = harness
            .controller
            .issuer()
            .current(&task.dns_name())
            .await
            .unwrap();
        assert_eq!(cert.common_name(), format!("{}.{}", task.task_id, SERVICE));
        verify_common_name(&cert, &task).unwrap();

        // 使用其他任务的名称验证失败
        let other = TaskIdentity::new(SERVICE, task.role, task.index + 1);
        assert!(matches!(
            verify_common_name(&cert, &other),
            Err(Error::NameMismatch { .. })
        ));
        assert!(trial_handshake(
            &cert,
            &ca_bundle,
            &other.dns_name(),
            std::time::Duration::from_secs(5)
        )
        .await
        .is_err());

        let binder = harness.controller.binder(&task.task_id).await.unwrap();
        let on_disk = std::fs::read_to_string(binder.sandbox_dir().join(CERT_FILE)).unwrap();
        assert_eq!(on_disk, cert.cert_pem);
    }
}

#[tokio::test]
async fn test_certificate_outside_allowed_suffix_is_denied() {
    // CA 允许的域名后缀不包含服务名称，签发被拒绝
    let foreign = SelfSignedCa::new("other", &["example.com"]).unwrap();
    let window = hdfs_guard_common::ValidityWindow::starting_now(chrono::Duration::hours(1));
    let err = foreign
        .issue_certificate("name-0-node.hdfs", &window)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CertificateDenied { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_kdc_outage_escalates_and_recovers_after_restart() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();

    // 新主体的 keytab 尚未导出时 KDC 不可用
    let task = TaskIdentity::new(SERVICE, Role::Journal, 2);
    for principal in PrincipalRegistry::principals_for_task(
        &harness.controller.topology().await.unwrap(),
        &task,
    ) {
        harness.controller.provisioner().revoke(&principal).await.unwrap();
    }
    harness.kdc.set_reachable(false);

    let state = harness.start(&task).await;
    assert!(matches!(state, BindingState::Unschedulable { .. }));
    assert!(!harness.controller.all_ready().await);

    harness.kdc.set_reachable(true);
    assert_eq!(harness.start(&task).await, BindingState::Ready);
}

#[tokio::test]
async fn test_concurrent_starts_all_reach_ready() {
    let harness = Arc::new(Harness::new());
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let topology = harness.controller.topology().await.unwrap();

    let starts = topology.tasks().into_iter().map(|task| {
        let harness = harness.clone();
        tokio::spawn(async move { harness.start(&task).await })
    });
    for state in futures::future::join_all(starts).await {
        assert_eq!(state.unwrap(), BindingState::Ready);
    }
    assert!(harness.controller.all_ready().await);

    harness.controller.shutdown().await;
    assert!(harness.controller.states().await.is_empty());
}

#[tokio::test]
async fn test_stop_keeps_credentials_for_fast_restart() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let task = TaskIdentity::new(SERVICE, Role::Name, 0);
    assert_eq!(harness.start(&task).await, BindingState::Ready);

    let principal = format!("hdfs/{}@{}", task.dns_name(), REALM);
    let kvno = harness.kdc.kvno(&principal).await;
    let sandbox = harness.sandbox.path().join(&task.task_id);
    assert!(sandbox.exists());

    harness
        .controller
        .handle_event(TaskEvent::Stop(task.clone()))
        .await
        .unwrap();
    assert!(!sandbox.exists());

    assert_eq!(harness.start(&task).await, BindingState::Ready);
    assert_eq!(harness.kdc.kvno(&principal).await, kvno);
}

#[tokio::test]
async fn test_dropped_primary_is_revoked_and_tasks_rebind() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let task = TaskIdentity::new(SERVICE, Role::Name, 0);
    assert_eq!(harness.start(&task).await, BindingState::Ready);
    let before = harness.controller.principals().await;

    let diff = harness
        .controller
        .apply_topology(common::topology().with_primaries(&["hdfs"]))
        .await
        .unwrap();
    assert_eq!(diff.removed.len(), 8);
    assert!(diff.removed.iter().all(|p| p.primary == "HTTP"));

    let after = harness.controller.principals().await;
    assert_eq!(after.len(), before.len() - diff.removed.len());
    assert_eq!(harness.kdc.principal_count().await, after.len());
    for principal in &diff.removed {
        assert!(!harness.kdc.contains(&principal.name()).await, "{}", principal);
    }

    // 运行中的任务按新的主体集合重新绑定
    let state = harness
        .controller
        .wait_settled(&task.task_id, std::time::Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state, BindingState::Ready);
    let binder = harness.controller.binder(&task.task_id).await.unwrap();
    assert!(binder.sandbox_dir().join("hdfs.keytab").exists());
    assert!(!binder.sandbox_dir().join("HTTP.keytab").exists());
}
