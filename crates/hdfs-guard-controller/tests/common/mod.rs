//! 集成测试共用的进程内环境

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hdfs_guard_common::{Error, Result, Role, ServiceTopology, TaskEvent, TaskIdentity};
use hdfs_guard_controller::ca::SelfSignedCa;
use hdfs_guard_controller::identity::{
    BinderConfig, BindingState, CertificateIssuer, CredentialProvisioner, IssuerConfig,
    ProvisionerConfig,
};
use hdfs_guard_controller::kdc::MemoryKdc;
use hdfs_guard_controller::secrets::MemorySecretStore;
use hdfs_guard_controller::utils::RetryPolicy;
use hdfs_guard_controller::{
    Access, AuthMappingResolver, AuthorizationHook, FileStatus, GuardMetrics, IdentityController,
    MappingRuleSpec,
};

pub const REALM: &str = "LOCAL";
pub const SERVICE: &str = "hdfs";

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        multiplier: 2.0,
        jitter: 0.0,
    }
}

/// hdfs 为超级用户，节点主体映射为 hdfs，其余本域用户映射为同名用户
pub fn rules() -> Vec<MappingRuleSpec> {
    vec![
        MappingRuleSpec::superuser("RULE:[2:$1@$0](hdfs@LOCAL)s/.*/hdfs/"),
        MappingRuleSpec::superuser("RULE:[2:$1@$0](HTTP@LOCAL)s/.*/hdfs/"),
        MappingRuleSpec::superuser("RULE:[1:$1@$0](hdfs@LOCAL)s/@.*//"),
        MappingRuleSpec::new("RULE:[1:$1@$0](.*@LOCAL)s/@.*//"),
    ]
}

pub fn topology() -> ServiceTopology {
    ServiceTopology::new(SERVICE, REALM)
        .with_role(Role::Journal, 3)
        .with_role(Role::Name, 2)
        .with_role(Role::Data, 3)
        .with_client("hdfs")
        .with_client("alice")
        .with_client("bob")
        .with_primaries(&["hdfs", "HTTP"])
}

pub struct Harness {
    pub controller: Arc<IdentityController>,
    pub kdc: Arc<MemoryKdc>,
    pub ca: Arc<SelfSignedCa>,
    pub sandbox: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let kdc = Arc::new(MemoryKdc::new(REALM));
        let ca = Arc::new(SelfSignedCa::new("hdfs-test", &[SERVICE]).unwrap());
        let sandbox = tempfile::tempdir().unwrap();

        let provisioner = Arc::new(CredentialProvisioner::new(
            kdc.clone(),
            Arc::new(MemorySecretStore::new()),
            SERVICE,
            ProvisionerConfig {
                request_timeout_secs: 5,
                retry: fast_retry(3),
            },
            metrics.clone(),
        ));
        let issuer = Arc::new(CertificateIssuer::new(
            ca.clone(),
            IssuerConfig {
                request_timeout_secs: 5,
                retry: fast_retry(3),
                ..IssuerConfig::default()
            },
            metrics.clone(),
        ));
        let resolver =
            Arc::new(AuthMappingResolver::from_specs(REALM, &rules(), metrics.clone()).unwrap());

        let controller = Arc::new(IdentityController::new(
            provisioner,
            issuer,
            resolver,
            BinderConfig {
                retry: fast_retry(3),
                sandbox_root: sandbox.path().to_path_buf(),
                verify_timeout_secs: 5,
            },
            metrics,
        ));

        Self {
            controller,
            kdc,
            ca,
            sandbox,
        }
    }

    /// 启动任务并等待绑定结束
    pub async fn start(&self, task: &TaskIdentity) -> BindingState {
        self.controller
            .handle_event(TaskEvent::Start(task.clone()))
            .await
            .unwrap();
        self.controller
            .wait_settled(&task.task_id, Duration::from_secs(10))
            .await
            .unwrap()
    }

    /// 启动拓扑中的全部任务
    pub async fn start_all(&self) {
        let topology = self.controller.topology().await.unwrap();
        for task in topology.tasks() {
            assert_eq!(self.start(&task).await, BindingState::Ready, "{}", task);
        }
    }
}

/// 极简的文件系统命名空间，只用于驱动授权钩子
///
/// 命令的返回值模仿 CLI：(退出码, 标准输出, 标准错误)。
pub struct Namespace {
    hook: AuthorizationHook,
    inodes: HashMap<String, FileStatus>,
    contents: HashMap<String, Vec<u8>>,
}

pub type Output = (i32, String, String);

impl Namespace {
    pub fn new(hook: AuthorizationHook) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            "/".to_string(),
            FileStatus::directory("/", "hdfs", "supergroup", 0o755),
        );
        Self {
            hook,
            inodes,
            contents: HashMap::new(),
        }
    }

    fn parent(path: &str) -> String {
        match path.rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        }
    }

    fn check(&self, principal: &str, path: &str, access: Access) -> Result<String> {
        let status = self
            .inodes
            .get(path)
            .ok_or_else(|| Error::SecretNotFound(path.to_string()))?;
        self.hook.check(principal, status, access)
    }

    fn fail(command: &str, e: Error) -> Output {
        (1, String::new(), format!("{}: {}", command, e))
    }

    pub fn mkdirs(&mut self, principal: &str, path: &str) -> Output {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let parent = if current.is_empty() { "/".to_string() } else { current.clone() };
            current = format!("{}/{}", current, part);
            if self.inodes.contains_key(&current) {
                continue;
            }
            let user = match self.check(principal, &parent, Access::Write) {
                Ok(user) => user,
                Err(e) => return Self::fail("mkdir", e),
            };
            self.inodes.insert(
                current.clone(),
                FileStatus::directory(&current, &user, "supergroup", 0o755),
            );
        }
        (0, String::new(), String::new())
    }

    pub fn chown(&mut self, principal: &str, path: &str, owner: &str, group: &str) -> Output {
        // 只有超级用户可以修改属主
        match self.check(principal, path, Access::Write) {
            Ok(user) if user == "hdfs" => {}
            Ok(user) => {
                return Self::fail("chown", Error::PermissionDenied(format!("user={}", user)))
            }
            Err(e) => return Self::fail("chown", e),
        }
        if let Some(status) = self.inodes.get_mut(path) {
            status.owner = owner.to_string();
            status.group = group.to_string();
        }
        (0, String::new(), String::new())
    }

    pub fn chmod(&mut self, principal: &str, path: &str, mode: u16) -> Output {
        if let Err(e) = self.check(principal, path, Access::Write) {
            return Self::fail("chmod", e);
        }
        if let Some(status) = self.inodes.get_mut(path) {
            status.mode = mode;
        }
        (0, String::new(), String::new())
    }

    pub fn put(&mut self, principal: &str, path: &str, bytes: &[u8]) -> Output {
        let parent = Self::parent(path);
        let user = match self
            .check(principal, &parent, Access::Execute)
            .and_then(|_| self.check(principal, &parent, Access::Write))
        {
            Ok(user) => user,
            Err(e) => return Self::fail("put", e),
        };
        self.inodes
            .insert(path.to_string(), FileStatus::file(path, &user, "supergroup", 0o644));
        self.contents.insert(path.to_string(), bytes.to_vec());
        (0, String::new(), String::new())
    }

    pub fn cat(&self, principal: &str, path: &str) -> Output {
        let parent = Self::parent(path);
        if let Err(e) = self.check(principal, &parent, Access::Execute) {
            return Self::fail("cat", e);
        }
        if let Err(e) = self.check(principal, path, Access::Read) {
            return Self::fail("cat", e);
        }
        let bytes = self.contents.get(path).cloned().unwrap_or_default();
        (0, String::from_utf8_lossy(&bytes).to_string(), String::new())
    }

    pub fn ls(&self, principal: &str, path: &str) -> Output {
        if let Err(e) = self.check(principal, path, Access::Read) {
            return Self::fail("ls", e);
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut entries: Vec<&String> = self
            .inodes
            .keys()
            .filter(|p| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .collect();
        entries.sort();
        let stdout = entries
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        (0, stdout, String::new())
    }
}
