//! 凭据供应模块
//!
//! 为每个主体向 KDC 申请 keytab，并以主体名为键写入密钥存储，
//! 只有有权的任务可以读取。同一主体的并发供应请求会被串行化，
//! 同一时刻最多一个请求在途。

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use hdfs_guard_common::{Error, Keytab, Principal, PrincipalKind, Result};

use crate::kdc::{KdcClient, PrincipalCreation};
use crate::metrics::GuardMetrics;
use crate::secrets::{SecretStore, CLIENT_SCOPE, CONTROLLER_SCOPE};
use crate::utils::{with_retry, with_timeout, KeyedLocks, RetryPolicy};

/// 凭据供应配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// 单次 KDC 请求超时（秒）
    pub request_timeout_secs: u64,
    /// KDC 请求重试策略
    pub retry: RetryPolicy,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// 凭据供应器
pub struct CredentialProvisioner {
    /// KDC 客户端
    kdc: Arc<dyn KdcClient>,
    /// 密钥存储
    store: Arc<dyn SecretStore>,
    /// 本服务在 KDC 中记录的归属
    owner: String,
    /// 按主体串行化的锁
    locks: KeyedLocks,
    /// 配置
    config: ProvisionerConfig,
    /// 指标
    metrics: Arc<GuardMetrics>,
}

impl CredentialProvisioner {
    /// 创建凭据供应器
    pub fn new(
        kdc: Arc<dyn KdcClient>,
        store: Arc<dyn SecretStore>,
        owner: &str,
        config: ProvisionerConfig,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            kdc,
            store,
            owner: owner.to_string(),
            locks: KeyedLocks::new(),
            config,
            metrics,
        }
    }

    /// KDC 客户端
    pub fn kdc(&self) -> &Arc<dyn KdcClient> {
        &self.kdc
    }

    /// 本服务的归属标识
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// 有权读取主体 keytab 的请求方
    pub fn entitlements(principal: &Principal) -> Vec<String> {
        match (&principal.kind, principal.task_id()) {
            (PrincipalKind::Service { .. }, Some(task_id)) => vec![task_id.to_string()],
            _ => vec![CLIENT_SCOPE.to_string()],
        }
    }

    /// 供应主体的 keytab
    ///
    /// 幂等：主体的 keytab 已在存储中时直接返回，不会重新导出。
    pub async fn provision(&self, principal: &Principal) -> Result<Keytab> {
        let name = principal.name();
        let _guard = self.locks.lock(&name).await;

        if let Some(bytes) = self.store.get(&name, CONTROLLER_SCOPE).await? {
            debug!("主体 {} 的 keytab 已存在", name);
            self.metrics.record_provision("cached");
            return Ok(Keytab::new(name, bytes));
        }

        match self.create_and_store(principal).await {
            Ok(keytab) => {
                self.metrics.record_provision("created");
                info!("已供应主体 {} ({} 字节)", name, keytab.len());
                Ok(keytab)
            }
            Err(e) => {
                self.metrics.record_provision("failed");
                warn!("供应主体 {} 失败: {}", name, e);
                Err(e)
            }
        }
    }

    /// 并发供应一组主体，不同主体之间互不阻塞
    pub async fn provision_all<'a, I>(&self, principals: I) -> Vec<(Principal, Result<Keytab>)>
    where
        I: IntoIterator<Item = &'a Principal>,
    {
        let futures = principals.into_iter().map(|principal| async move {
            (principal.clone(), self.provision(principal).await)
        });
        join_all(futures).await
    }

    /// 吊销主体：删除存储中的 keytab 并在 KDC 中删除主体
    pub async fn revoke(&self, principal: &Principal) -> Result<()> {
        let name = principal.name();
        let _guard = self.locks.lock(&name).await;

        let existed = self.store.delete(&name).await?;
        with_retry(&self.config.retry, "delete_principal", || {
            with_timeout(self.timeout(), "delete_principal", self.kdc.delete_principal(&name))
        })
        .await?;

        self.metrics.record_provision("revoked");
        info!("已吊销主体 {} (存储条目存在: {})", name, existed);
        Ok(())
    }

    /// 以指定请求方身份读取已供应的 keytab
    pub async fn fetch(&self, principal: &Principal, requester: &str) -> Result<Keytab> {
        let name = principal.name();
        match self.store.get(&name, requester).await? {
            Some(bytes) => Ok(Keytab::new(name, bytes)),
            None => Err(Error::SecretNotFound(name)),
        }
    }

    async fn create_and_store(&self, principal: &Principal) -> Result<Keytab> {
        let name = principal.name();

        let creation = with_retry(&self.config.retry, "create_principal", || {
            with_timeout(
                self.timeout(),
                "create_principal",
                self.kdc.create_principal(&name, &self.owner),
            )
        })
        .await?;

        if let PrincipalCreation::Exists { owner } = creation {
            if owner.as_deref() != Some(self.owner.as_str()) {
                return Err(Error::PrincipalConflict {
                    principal: name,
                    owner: owner.unwrap_or_else(|| "未知".to_string()),
                });
            }
            debug!("主体 {} 已由本服务创建，重新导出 keytab", name);
        }

        let bytes = with_retry(&self.config.retry, "get_keytab", || {
            with_timeout(self.timeout(), "get_keytab", self.kdc.get_keytab(&name))
        })
        .await?;
        if bytes.is_empty() {
            return Err(Error::Kdc(format!("{} 的 keytab 为空", name)));
        }

        self.store
            .put(&name, bytes.clone(), &Self::entitlements(principal))
            .await?;
        Ok(Keytab::new(name, bytes))
    }
}
