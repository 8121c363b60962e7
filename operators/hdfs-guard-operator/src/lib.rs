//! HDFS Guard Operator - 在 Kubernetes 中托管 HDFS 服务身份
//!
//! 该模块把身份控制核心部署为 Kubernetes Operator：加载配置、用 Secret
//! 保存 keytab、监听 Pod 生命周期驱动身份绑定，并提供健康检查与指标接口。

pub mod config;
pub mod event_handler;
pub mod health_check;
pub mod secret_store;

use anyhow::{Context, Result};
use futures::future::join_all;
use kube::Client;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hdfs_guard_controller::ca::{CertificateAuthority, SelfSignedCa};
use hdfs_guard_controller::identity::{CertificateIssuer, CredentialProvisioner};
use hdfs_guard_controller::kdc::{KadminKdc, KdcClient, MemoryKdc};
use hdfs_guard_controller::secrets::{MemorySecretStore, SecretStore};
use hdfs_guard_controller::{AuthMappingResolver, GuardMetrics, IdentityController};

use crate::config::{KdcBackend, OperatorConfig, RulesWatcher, SecretsBackend};
use crate::event_handler::EventHandler;
use crate::health_check::HealthServer;
use crate::secret_store::KubeSecretStore;

/// 按配置组装身份控制器
pub fn build_controller(
    config: &OperatorConfig,
    store: Arc<dyn SecretStore>,
) -> Result<Arc<IdentityController>> {
    let specs = config.validate()?;
    let metrics = Arc::new(GuardMetrics::new().context("创建指标失败")?);

    let kdc: Arc<dyn KdcClient> = match config.kerberos.backend {
        KdcBackend::Kadmin => Arc::new(KadminKdc::new(config.kerberos.kdc.clone())),
        KdcBackend::Memory => {
            warn!("使用进程内 KDC，签发的 keytab 只在本进程内有效");
            Arc::new(MemoryKdc::new(&config.service.realm))
        }
    };
    let ca: Arc<dyn CertificateAuthority> = Arc::new(load_ca(config)?);

    let owner = format!("hdfs-guard:{}", config.service.name);
    let provisioner = Arc::new(CredentialProvisioner::new(
        kdc,
        store,
        &owner,
        config.kerberos.provisioner.clone(),
        metrics.clone(),
    ));
    let issuer = Arc::new(CertificateIssuer::new(
        ca,
        config.tls.issuer.clone(),
        metrics.clone(),
    ));
    let resolver = Arc::new(
        AuthMappingResolver::from_specs(&config.service.realm, &specs, metrics.clone())
            .context("加载映射规则失败")?,
    );

    Ok(Arc::new(IdentityController::new(
        provisioner,
        issuer,
        resolver,
        config.binder.clone(),
        metrics,
    )))
}

/// 加载或生成 CA
///
/// 配置了根证书与私钥路径时：文件存在则加载，不存在则生成后写入，
/// 私钥文件权限为 0600。未配置路径时每次启动生成新的根证书。
pub fn load_ca(config: &OperatorConfig) -> Result<SelfSignedCa> {
    let suffixes = config.allowed_suffixes();
    let suffixes: Vec<&str> = suffixes.iter().map(String::as_str).collect();
    let ca_config = &config.tls.ca;

    let (cert_path, key_path) = match (&ca_config.cert_path, &ca_config.key_path) {
        (Some(cert_path), Some(key_path)) => (cert_path, key_path),
        (None, None) => {
            warn!("未配置 CA 根证书路径，生成临时根证书");
            return SelfSignedCa::new(&ca_config.name, &suffixes).context("生成 CA 失败");
        }
        _ => anyhow::bail!("CA 根证书与私钥路径必须同时配置"),
    };

    if cert_path.exists() && key_path.exists() {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("无法读取 CA 根证书: {:?}", cert_path))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("无法读取 CA 私钥: {:?}", key_path))?;
        info!("加载 CA 根证书: {:?}", cert_path);
        return SelfSignedCa::from_pem(&cert_pem, &key_pem, &suffixes).context("加载 CA 失败");
    }

    let ca = SelfSignedCa::new(&ca_config.name, &suffixes).context("生成 CA 失败")?;
    write_file(cert_path, ca.root_cert_pem(), 0o644)?;
    write_file(key_path, &ca.root_key_pem(), 0o600)?;
    info!("生成并保存 CA 根证书: {:?}", cert_path);
    Ok(ca)
}

fn write_file(path: &Path, content: &str, mode: u32) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("无法创建目录: {:?}", dir))?;
    }
    std::fs::write(path, content).with_context(|| format!("无法写入文件: {:?}", path))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("无法设置文件权限: {:?}", path))?;
    Ok(())
}

/// Operator 主结构体
pub struct HdfsGuardOperator {
    /// 配置
    config: OperatorConfig,
    /// 身份控制器
    controller: Arc<IdentityController>,
    /// Pod 事件处理器
    event_handler: EventHandler,
    /// 规则文件监听器
    rules_watcher: Mutex<Option<RulesWatcher>>,
    /// 后台任务
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// 取消令牌
    cancel: CancellationToken,
}

impl HdfsGuardOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("创建 Kubernetes 客户端失败")?;

        let namespace = config.secrets.namespace.clone();
        let store: Arc<dyn SecretStore> = match config.secrets.backend {
            SecretsBackend::Kubernetes => match &namespace {
                Some(namespace) => Arc::new(KubeSecretStore::namespaced(client.clone(), namespace)),
                None => Arc::new(KubeSecretStore::new(client.clone())),
            },
            SecretsBackend::Memory => {
                warn!("使用进程内密钥存储，重启后需要重新供应凭据");
                Arc::new(MemorySecretStore::new())
            }
        };

        let controller = build_controller(&config, store)?;
        let event_handler =
            EventHandler::new(client, controller.clone(), &config.service.name, namespace);

        Ok(Self {
            config,
            controller,
            event_handler,
            rules_watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// 身份控制器
    pub fn controller(&self) -> &Arc<IdentityController> {
        &self.controller
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        let diff = self
            .controller
            .apply_topology(self.config.service.clone())
            .await
            .context("应用服务拓扑失败")?;
        info!(
            "服务 {} 的拓扑已生效，新增 {} 个主体",
            self.config.service.name,
            diff.added.len()
        );

        let mut tasks = self.tasks.lock().await;
        tasks.extend(self.controller.start());

        if let Some(path) = &self.config.mapping.rules_file {
            let watcher = RulesWatcher::start(path.clone(), self.controller.clone())?;
            *self.rules_watcher.lock().await = Some(watcher);
        }

        tasks.extend(self.event_handler.start());

        let server = HealthServer::new(self.controller.clone(), &self.config.health)?;
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(cancel).await {
                error!("{:#}", e);
            }
        }));

        info!("HDFS Guard Operator 已启动");
        Ok(())
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        self.event_handler.stop();
        self.cancel.cancel();
        self.rules_watcher.lock().await.take();
        self.controller.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("后台任务异常退出: {}", e);
            }
        }

        info!("HDFS Guard Operator 已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdfs_guard_common::{Role, TaskEvent, TaskIdentity};
    use hdfs_guard_controller::BindingState;
    use std::time::Duration;

    use crate::config::create_default_config;

    fn memory_config(sandbox: &Path) -> OperatorConfig {
        let mut config = create_default_config();
        config.kerberos.backend = KdcBackend::Memory;
        config.secrets.backend = SecretsBackend::Memory;
        config.binder.sandbox_root = sandbox.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_build_controller_binds_task() {
        let sandbox = tempfile::tempdir().unwrap();
        let config = memory_config(sandbox.path());
        let controller = build_controller(&config, Arc::new(MemorySecretStore::new())).unwrap();

        let diff = controller.apply_topology(config.service.clone()).await.unwrap();
        assert_eq!(diff.added.len(), 17);

        let task = TaskIdentity::new("hdfs", Role::Data, 2);
        controller
            .handle_event(TaskEvent::Start(task.clone()))
            .await
            .unwrap();
        let state = controller
            .wait_settled(&task.task_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(state, BindingState::Ready);
        assert!(sandbox.path().join("data-2-node").join("hdfs.keytab").exists());

        controller.shutdown().await;
    }

    #[test]
    fn test_build_controller_rejects_unmapped_topology() {
        let sandbox = tempfile::tempdir().unwrap();
        let mut config = memory_config(sandbox.path());
        config.mapping.rules.clear();
        assert!(build_controller(&config, Arc::new(MemorySecretStore::new())).is_err());
    }

    #[test]
    fn test_ca_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(dir.path());
        config.tls.ca.cert_path = Some(dir.path().join("ca/root.crt"));
        config.tls.ca.key_path = Some(dir.path().join("ca/root.key"));

        let first = load_ca(&config).unwrap();
        let mode = std::fs::metadata(dir.path().join("ca/root.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let second = load_ca(&config).unwrap();
        assert_eq!(first.root_cert_pem(), second.root_cert_pem());
    }

    #[test]
    fn test_ca_paths_must_be_paired() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(dir.path());
        config.tls.ca.cert_path = Some(dir.path().join("root.crt"));
        assert!(load_ca(&config).is_err());
    }
}
