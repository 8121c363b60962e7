//! 用户目录权限场景：alice 的私有目录对 bob 不可见

mod common;

use std::sync::Arc;

use common::{Harness, Namespace, REALM};
use hdfs_guard_common::{Error, Principal};
use hdfs_guard_controller::kdc::KdcClient;
use hdfs_guard_controller::secrets::CLIENT_SCOPE;
use hdfs_guard_controller::{AuthorizationHook, Resolution};

/// 相当于用客户端 keytab 执行 kinit，返回主体名称
async fn kinit(harness: &Harness, user: &str) -> String {
    let principal = Principal::client(user, REALM);
    let keytab = harness
        .controller
        .provisioner()
        .fetch(&principal, CLIENT_SCOPE)
        .await
        .unwrap();
    harness
        .controller
        .provisioner()
        .kdc()
        .authenticate(&principal.name(), keytab.bytes())
        .await
        .unwrap();
    principal.name()
}

#[tokio::test]
async fn test_users_cannot_read_each_others_directories() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    harness.start_all().await;

    let mut fs = Namespace::new(AuthorizationHook::new(harness.controller.resolver().clone()));

    // hdfs 是超级用户
    let hdfs = kinit(&harness, "hdfs").await;
    assert_eq!(fs.mkdirs(&hdfs, "/users/alice").0, 0);
    assert_eq!(fs.chown(&hdfs, "/users/alice", "alice", "users").0, 0);
    assert_eq!(fs.chmod(&hdfs, "/users/alice", 0o700).0, 0);

    // alice 可以读写自己的目录
    let alice = kinit(&harness, "alice").await;
    let content = "hello from alice";
    let (code, stdout, _) = fs.put(&alice, "/users/alice/test_file", content.as_bytes());
    assert_eq!(code, 0);
    assert_eq!(stdout, "");

    let (code, stdout, _) = fs.cat(&alice, "/users/alice/test_file");
    assert_eq!(code, 0);
    assert_eq!(stdout, content);

    let (_, stdout, _) = fs.ls(&alice, "/users/alice");
    assert!(stdout.contains("/users/alice/test_file"));

    // bob 无法读写 alice 的目录
    let bob = kinit(&harness, "bob").await;
    let (code, _, stderr) = fs.put(&bob, "/users/alice/test_file", b"from bob");
    assert_ne!(code, 0);
    assert!(stderr.contains("put: Permission denied: user=bob"), "{}", stderr);

    let (code, _, stderr) = fs.cat(&bob, "/users/alice/test_file");
    assert_ne!(code, 0);
    assert!(stderr.contains("cat: Permission denied: user=bob"), "{}", stderr);

    // 文件内容保持不变
    assert_eq!(fs.cat(&alice, "/users/alice/test_file").1, content);
}

#[tokio::test]
async fn test_service_principals_resolve_to_superuser() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let resolver = harness.controller.resolver();

    for principal in harness.controller.principals().await {
        let resolution = resolver.resolve_principal(&principal);
        match principal.task_id() {
            Some(_) => assert_eq!(
                resolution,
                Resolution::Mapped {
                    username: "hdfs".to_string(),
                    superuser: true
                },
                "{}",
                principal
            ),
            None => assert!(resolution.username().is_some(), "{}", principal),
        }
    }
}

#[tokio::test]
async fn test_unmapped_principal_is_denied_per_operation() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();
    let mut fs = Namespace::new(AuthorizationHook::new(harness.controller.resolver().clone()));
    fs.mkdirs("hdfs@LOCAL", "/tmp");
    fs.chmod("hdfs@LOCAL", "/tmp", 0o777);

    let (code, _, stderr) = fs.put("mallory@EVIL", "/tmp/f", b"x");
    assert_ne!(code, 0);
    assert!(stderr.contains(&Error::Unmapped("mallory@EVIL".into()).to_string()));

    // 其他用户不受影响
    assert_eq!(fs.put("alice@LOCAL", "/tmp/f", b"x").0, 0);
}

#[tokio::test]
async fn test_rule_reload_cannot_unmap_provisioned_principals() {
    let harness = Harness::new();
    harness.controller.apply_topology(common::topology()).await.unwrap();

    let narrowed = vec![hdfs_guard_controller::MappingRuleSpec::new(
        "RULE:[1:$1@$0](.*@LOCAL)s/@.*//",
    )];
    let err = harness.controller.replace_rules(&narrowed).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRule(_)));

    let resolver = Arc::clone(harness.controller.resolver());
    assert!(resolver
        .resolve("hdfs/name-0-node.hdfs@LOCAL")
        .is_superuser());
}
