//! 身份绑定模块
//!
//! 每个任务实例有一个独立的绑定状态机：
//!
//! ```text
//! Unbound -> Binding -> Verified -> Ready
//!               |  ^
//!               v  |
//!              Failed -> Unschedulable
//! ```
//!
//! 进入 `Verified` 需要 keytab 能向 KDC 完成试认证、证书 CN 与任务身份
//! 完全一致，并且使用 CA 证书包的试握手成功。只有 `Ready` 状态的任务
//! 才接受业务流量。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hdfs_guard_common::{Certificate, Error, Keytab, Principal, Result, TaskIdentity};

use crate::identity::issuer::CertificateIssuer;
use crate::identity::provisioner::CredentialProvisioner;
use crate::kdc::KdcClient;
use crate::metrics::GuardMetrics;
use crate::tls::{trial_handshake, verify_common_name, HandshakeReport};
use crate::utils::{replace_private_file, with_timeout, RetryPolicy};

/// 证书文件名
pub const CERT_FILE: &str = "node.crt";
/// 私钥文件名
pub const KEY_FILE: &str = "node.key";
/// CA 证书包文件名
pub const CA_BUNDLE_FILE: &str = "ca-bundle.crt";

/// 绑定状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BindingState {
    /// 未绑定
    Unbound,
    /// 正在绑定，attempt 从 1 开始
    Binding { attempt: u32 },
    /// 凭据已验证
    Verified,
    /// 可以接受业务流量
    Ready,
    /// 本次尝试失败
    Failed { attempt: u32, reason: String },
    /// 超过重试上限或遇到不可重试的错误，需要运维介入
    Unschedulable { reason: String },
}

impl BindingState {
    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Unbound => "unbound",
            BindingState::Binding { .. } => "binding",
            BindingState::Verified => "verified",
            BindingState::Ready => "ready",
            BindingState::Failed { .. } => "failed",
            BindingState::Unschedulable { .. } => "unschedulable",
        }
    }

    /// 是否可以接受业务流量
    pub fn is_ready(&self) -> bool {
        matches!(self, BindingState::Ready)
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, BindingState::Ready | BindingState::Unschedulable { .. })
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::Binding { attempt } => write!(f, "binding (第 {} 次)", attempt),
            BindingState::Failed { attempt, reason } => {
                write!(f, "failed (第 {} 次): {}", attempt, reason)
            }
            BindingState::Unschedulable { reason } => write!(f, "unschedulable: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 身份绑定配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// 绑定重试策略，max_attempts 为升级到 Unschedulable 前的尝试次数
    pub retry: RetryPolicy,
    /// 任务运行时目录的根目录
    pub sandbox_root: PathBuf,
    /// 试认证与试握手的超时（秒）
    pub verify_timeout_secs: u64,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
                multiplier: 2.0,
                jitter: 0.2,
            },
            sandbox_root: PathBuf::from("/var/run/hdfs-guard"),
            verify_timeout_secs: 10,
        }
    }
}

/// 凭据占用登记表
///
/// 同一份凭据材料（keytab 与证书）同一时刻最多被一个存活的绑定持有。
#[derive(Debug, Clone, Default)]
pub struct BindingLedger {
    holders: Arc<Mutex<HashMap<String, Holder>>>,
}

#[derive(Debug, Clone)]
struct Holder {
    binding_id: String,
    task_id: String,
}

impl BindingLedger {
    /// 创建登记表
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一组凭据登记占用，任一凭据被其他绑定持有时失败
    pub fn reserve(&self, credentials: &[String], binding_id: &str, task_id: &str) -> Result<Reservation> {
        let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());

        for credential in credentials {
            if let Some(holder) = holders.get(credential) {
                if holder.binding_id != binding_id {
                    return Err(Error::CredentialInUse {
                        credential: credential.clone(),
                        holder: holder.task_id.clone(),
                    });
                }
            }
        }

        for credential in credentials {
            holders.insert(
                credential.clone(),
                Holder {
                    binding_id: binding_id.to_string(),
                    task_id: task_id.to_string(),
                },
            );
        }

        Ok(Reservation {
            ledger: self.clone(),
            credentials: credentials.to_vec(),
            binding_id: binding_id.to_string(),
        })
    }

    /// 凭据当前的持有任务
    pub fn holder_of(&self, credential: &str) -> Option<String> {
        self.holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(credential)
            .map(|holder| holder.task_id.clone())
    }

    fn release(&self, credentials: &[String], binding_id: &str) {
        let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        for credential in credentials {
            if holders
                .get(credential)
                .map(|holder| holder.binding_id == binding_id)
                .unwrap_or(false)
            {
                holders.remove(credential);
            }
        }
    }
}

/// 凭据占用，丢弃时释放
#[derive(Debug)]
pub struct Reservation {
    ledger: BindingLedger,
    credentials: Vec<String>,
    binding_id: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(&self.credentials, &self.binding_id);
    }
}

/// 已验证的绑定材料
#[derive(Debug, Clone)]
pub struct BindingMaterial {
    /// 每个服务主体的 keytab
    pub keytabs: Vec<(Principal, Keytab)>,
    /// 任务证书
    pub certificate: Certificate,
    /// CA 证书包
    pub ca_bundle: String,
    /// 试握手报告
    pub handshake: HandshakeReport,
}

/// 处于 Ready 状态的绑定
struct ActiveBinding {
    _reservation: Reservation,
    certificate_serial: String,
}

/// 单个任务的身份绑定器
pub struct IdentityBinder {
    /// 任务身份
    task: TaskIdentity,
    /// 任务的服务主体
    principals: Vec<Principal>,
    /// 凭据供应器
    provisioner: Arc<CredentialProvisioner>,
    /// 证书签发器
    issuer: Arc<CertificateIssuer>,
    /// 凭据占用登记表
    ledger: BindingLedger,
    /// 配置
    config: BinderConfig,
    /// 指标
    metrics: Arc<GuardMetrics>,
    /// 本次绑定的唯一标识
    binding_id: String,
    /// 状态广播
    state_tx: watch::Sender<BindingState>,
    /// 任务当前采用的证书
    certificate_tx: watch::Sender<Option<Certificate>>,
    /// 当前生效的绑定
    active: tokio::sync::Mutex<Option<ActiveBinding>>,
}

impl IdentityBinder {
    /// 创建绑定器，初始状态为 Unbound
    pub fn new(
        task: TaskIdentity,
        principals: Vec<Principal>,
        provisioner: Arc<CredentialProvisioner>,
        issuer: Arc<CertificateIssuer>,
        ledger: BindingLedger,
        config: BinderConfig,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(BindingState::Unbound);
        let (certificate_tx, _) = watch::channel(None);
        metrics.record_transition(None, BindingState::Unbound.as_str());
        Self {
            task,
            principals,
            provisioner,
            issuer,
            ledger,
            config,
            metrics,
            binding_id: Uuid::new_v4().to_string(),
            state_tx,
            certificate_tx,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// 任务身份
    pub fn task(&self) -> &TaskIdentity {
        &self.task
    }

    /// 当前状态
    pub fn state(&self) -> BindingState {
        self.state_tx.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.state_tx.subscribe()
    }

    /// 任务运行时目录
    pub fn sandbox_dir(&self) -> PathBuf {
        self.config.sandbox_root.join(&self.task.task_id)
    }

    fn transition(&self, next: BindingState) {
        let previous = self.state_tx.borrow().as_str();
        self.metrics.record_transition(Some(previous), next.as_str());
        debug!("任务 {} 状态变更: {} -> {}", self.task, previous, next);
        self.state_tx.send_replace(next);
    }

    /// 需要独占的凭据：每个服务主体的 keytab 与任务证书
    fn credentials(&self) -> Vec<String> {
        let mut credentials: Vec<String> = self.principals.iter().map(|p| p.name()).collect();
        credentials.push(format!("cert:{}", self.task.dns_name()));
        credentials
    }

    /// 运行绑定状态机直到 Ready、Unschedulable 或被取消
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.transition(BindingState::Binding { attempt });

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.attempt() => result,
            };

            let error = match result {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => {
                    info!("任务 {} 的绑定被取消", self.task);
                    self.release().await;
                    return Err(Error::Cancelled);
                }
                Err(e) => e,
            };

            warn!("任务 {} 第 {} 次绑定失败: {}", self.task, attempt, error);
            self.transition(BindingState::Failed {
                attempt,
                reason: error.to_string(),
            });

            if !error.is_retryable() || attempt >= policy.max_attempts {
                error!("任务 {} 无法调度: {}", self.task, error);
                self.transition(BindingState::Unschedulable {
                    reason: error.to_string(),
                });
                return Err(error);
            }

            let delay = policy.backoff(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.release().await;
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 单次绑定尝试：取凭据、验证、写入运行时目录并进入 Ready
    async fn attempt(&self) -> Result<()> {
        let reservation = self
            .ledger
            .reserve(&self.credentials(), &self.binding_id, &self.task.task_id)?;

        let material = self.verify().await?;
        self.transition(BindingState::Verified);

        if let Err(e) = self.materialize(&material).await {
            self.remove_sandbox().await;
            return Err(e);
        }
        self.issuer
            .register_holder(&self.task.dns_name(), &self.binding_id)
            .await;
        self.issuer
            .acknowledge(
                &self.task.dns_name(),
                &self.binding_id,
                material.certificate.serial(),
            )
            .await;

        *self.active.lock().await = Some(ActiveBinding {
            _reservation: reservation,
            certificate_serial: material.certificate.serial().to_string(),
        });
        self.certificate_tx
            .send_replace(Some(material.certificate.clone()));
        self.transition(BindingState::Ready);
        info!(
            "任务 {} 已就绪 (证书 {}, {} / {})",
            self.task,
            material.certificate.serial(),
            material.handshake.protocol,
            material.handshake.cipher_suite
        );
        Ok(())
    }

    /// 获取并验证绑定材料
    pub async fn verify(&self) -> Result<BindingMaterial> {
        let timeout = Duration::from_secs(self.config.verify_timeout_secs);
        let kdc = self.provisioner.kdc().clone();

        let mut keytabs = Vec::with_capacity(self.principals.len());
        for principal in &self.principals {
            self.provisioner.provision(principal).await?;
            // 以任务自身的身份读取，验证访问范围
            let keytab = self.provisioner.fetch(principal, &self.task.task_id).await?;
            let name = principal.name();
            with_timeout(timeout, "trial_authentication", kdc.authenticate(&name, keytab.bytes()))
                .await?;
            keytabs.push((principal.clone(), keytab));
        }

        let certificate = self.issuer.certificate_for(&self.task).await?;
        verify_common_name(&certificate, &self.task)?;

        let ca_bundle = self.issuer.ca_bundle().await?;
        let handshake =
            trial_handshake(&certificate, &ca_bundle, &self.task.dns_name(), timeout).await?;

        Ok(BindingMaterial {
            keytabs,
            certificate,
            ca_bundle,
            handshake,
        })
    }

    /// 将绑定材料写入任务运行时目录，所有文件权限为 0600
    async fn materialize(&self, material: &BindingMaterial) -> Result<()> {
        let dir = self.sandbox_dir();
        create_private_dir(&dir).await?;

        for (principal, keytab) in &material.keytabs {
            let path = dir.join(format!("{}.keytab", principal.primary));
            replace_private_file(&path, keytab.bytes()).await?;
        }
        write_certificate(&dir, &material.certificate).await?;
        replace_private_file(&dir.join(CA_BUNDLE_FILE), material.ca_bundle.as_bytes()).await?;

        debug!("已写入任务 {} 的运行时目录 {}", self.task, dir.display());
        Ok(())
    }

    /// 采用签发器中的最新证书；任务未就绪或证书未变化时不做任何事
    pub async fn refresh_certificate(&self) -> Result<bool> {
        let mut active = self.active.lock().await;
        let Some(binding) = active.as_mut() else {
            return Ok(false);
        };

        let dns_name = self.task.dns_name();
        let Some(certificate) = self.issuer.current(&dns_name).await else {
            return Ok(false);
        };
        if certificate.serial() == binding.certificate_serial {
            return Ok(false);
        }
        verify_common_name(&certificate, &self.task)?;

        write_certificate(&self.sandbox_dir(), &certificate).await?;
        // 先发布新证书再确认，确认后旧证书可能立即失效
        self.certificate_tx.send_replace(Some(certificate.clone()));
        self.issuer
            .acknowledge(&dns_name, &self.binding_id, certificate.serial())
            .await;
        info!(
            "任务 {} 采用新证书 {} (替换 {})",
            self.task,
            certificate.serial(),
            binding.certificate_serial
        );
        binding.certificate_serial = certificate.serial().to_string();
        Ok(true)
    }

    /// 当前使用的证书序列号
    pub async fn certificate_serial(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|binding| binding.certificate_serial.clone())
    }

    /// 释放绑定：删除运行时目录并回到 Unbound，密钥存储中的凭据保留
    pub async fn release(&self) {
        let released = self.active.lock().await.take();
        self.certificate_tx.send_replace(None);
        if released.is_some() {
            self.issuer
                .release_holder(&self.task.dns_name(), &self.binding_id)
                .await;
        }

        self.remove_sandbox().await;

        if self.state() != BindingState::Unbound {
            self.transition(BindingState::Unbound);
        }
    }

    async fn remove_sandbox(&self) {
        let dir = self.sandbox_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("已删除任务 {} 的运行时目录", self.task),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除运行时目录 {} 失败: {}", dir.display(), e),
        }
    }

    /// 订阅任务采用的证书，未就绪时为 `None`
    pub fn subscribe_certificate(&self) -> watch::Receiver<Option<Certificate>> {
        self.certificate_tx.subscribe()
    }

    /// 本次绑定的标识，也是证书持有方的登记名
    pub fn binding_id(&self) -> &str {
        &self.binding_id
    }
}

impl Drop for IdentityBinder {
    fn drop(&mut self) {
        self.metrics.record_exit(self.state_tx.borrow().as_str());
    }
}

async fn write_certificate(dir: &Path, certificate: &Certificate) -> Result<()> {
    replace_private_file(&dir.join(CERT_FILE), certificate.cert_pem.as_bytes()).await?;
    replace_private_file(&dir.join(KEY_FILE), certificate.key_pem().as_bytes()).await?;
    Ok(())
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}
