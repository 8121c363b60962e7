//! 证书签发模块
//!
//! 为每个可寻址的任务端点申请绑定到稳定 DNS 名称的 TLS 证书，
//! 跟踪有效期并在到期前（扣除安全余量）重新签发。
//!
//! 重新签发后，旧证书作为 `previous` 保留在验证集合中，直到所有持有方
//! 确认采用新证书或旧证书过期，避免出现验证空窗。

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hdfs_guard_common::{Certificate, Error, Result, TaskIdentity, ValidityWindow};

use crate::ca::{parse_certificate, CertificateAuthority};
use crate::metrics::GuardMetrics;
use crate::utils::{format_duration, with_retry, with_timeout, KeyedLocks, RetryPolicy};

/// 证书签发配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// 证书有效期（秒）
    pub validity_secs: u64,
    /// 到期前的安全余量（秒）
    pub margin_secs: u64,
    /// 后台检查间隔（秒）
    pub check_interval_secs: u64,
    /// 单次 CA 请求超时（秒）
    pub request_timeout_secs: u64,
    /// CA 请求重试策略
    pub retry: RetryPolicy,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            validity_secs: 7 * 24 * 3600,
            margin_secs: 24 * 3600,
            check_interval_secs: 300,
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl IssuerConfig {
    /// 校验有效期与安全余量
    ///
    /// 余量不小于有效期时，新签发的证书立即被视为即将过期。
    pub fn validate(&self) -> Result<()> {
        if self.validity_secs == 0 {
            return Err(Error::Config("证书有效期必须大于 0".to_string()));
        }
        if self.margin_secs >= self.validity_secs {
            return Err(Error::Config(format!(
                "证书安全余量 {}s 必须小于有效期 {}s",
                self.margin_secs, self.validity_secs
            )));
        }
        Ok(())
    }

    /// 安全余量
    pub fn margin(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.margin_secs as i64)
    }

    /// 新证书的有效期窗口
    pub fn validity_window(&self) -> ValidityWindow {
        ValidityWindow::starting_now(ChronoDuration::seconds(self.validity_secs as i64))
    }
}

/// 证书轮换事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRotated {
    /// DNS 名称
    pub dns_name: String,
    /// 新证书序列号
    pub serial: String,
    /// 被替换证书的序列号
    pub previous_serial: Option<String>,
}

/// 单个 DNS 名称的证书槽
#[derive(Debug, Clone)]
struct CertSlot {
    current: Certificate,
    previous: Option<Certificate>,
    /// 登记的持有方
    holders: HashSet<String>,
    /// 已确认采用 current 的持有方
    acknowledged: HashSet<String>,
}

impl CertSlot {
    fn new(current: Certificate) -> Self {
        Self {
            current,
            previous: None,
            holders: HashSet::new(),
            acknowledged: HashSet::new(),
        }
    }

    fn rotate(&mut self, next: Certificate) -> Option<String> {
        let old = std::mem::replace(&mut self.current, next);
        let old_serial = old.serial().to_string();
        self.previous = if old.is_expired() { None } else { Some(old) };
        self.acknowledged.clear();
        self.prune();
        Some(old_serial)
    }

    /// 所有持有方都已确认或旧证书过期时移除 previous
    fn prune(&mut self) {
        let adopted = self.holders.iter().all(|h| self.acknowledged.contains(h));
        let expired = self.previous.as_ref().map(|p| p.is_expired()).unwrap_or(false);
        if self.previous.is_some() && (adopted || expired) {
            if let Some(previous) = self.previous.take() {
                debug!(
                    "移除 {} 的旧证书 {}",
                    self.current.common_name(),
                    previous.serial()
                );
            }
        }
    }
}

/// 证书签发器
pub struct CertificateIssuer {
    /// CA 客户端
    ca: Arc<dyn CertificateAuthority>,
    /// 按 DNS 名称索引的证书槽
    slots: RwLock<HashMap<String, CertSlot>>,
    /// 按 DNS 名称串行化的锁
    locks: KeyedLocks,
    /// 配置
    config: IssuerConfig,
    /// 指标
    metrics: Arc<GuardMetrics>,
    /// 轮换事件广播
    rotations: broadcast::Sender<CertificateRotated>,
}

impl CertificateIssuer {
    /// 创建证书签发器
    pub fn new(
        ca: Arc<dyn CertificateAuthority>,
        config: IssuerConfig,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        let (rotations, _) = broadcast::channel(64);
        Self {
            ca,
            slots: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            config,
            metrics,
            rotations,
        }
    }

    /// 配置
    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// 订阅证书轮换事件
    pub fn subscribe(&self) -> broadcast::Receiver<CertificateRotated> {
        self.rotations.subscribe()
    }

    /// 证书是否在安全余量内即将过期
    pub fn is_expiring_soon(cert: &Certificate, margin: ChronoDuration) -> bool {
        cert.is_expiring_soon(margin, Utc::now())
    }

    /// 为 DNS 名称签发新证书并替换当前证书
    pub async fn issue(&self, dns_name: &str, validity: &ValidityWindow) -> Result<Certificate> {
        let _guard = self.locks.lock(dns_name).await;
        self.issue_locked(dns_name, validity).await
    }

    /// 获取任务的有效证书，没有或即将过期时签发新证书
    pub async fn certificate_for(&self, task: &TaskIdentity) -> Result<Certificate> {
        let dns_name = task.dns_name();
        let _guard = self.locks.lock(&dns_name).await;

        if let Some(slot) = self.slots.read().await.get(&dns_name) {
            if !Self::is_expiring_soon(&slot.current, self.config.margin()) {
                return Ok(slot.current.clone());
            }
        }
        self.issue_locked(&dns_name, &self.config.validity_window())
            .await
    }

    async fn issue_locked(&self, dns_name: &str, validity: &ValidityWindow) -> Result<Certificate> {
        let issued = with_retry(&self.config.retry, "issue_certificate", || {
            with_timeout(
                self.timeout(),
                "issue_certificate",
                self.ca.issue_certificate(dns_name, validity),
            )
        })
        .await
        .map_err(|e| {
            self.metrics.record_certificate("failed");
            e
        })?;

        let info = parse_certificate(&issued.cert_pem)?;
        if info.common_name != dns_name {
            self.metrics.record_certificate("failed");
            return Err(Error::NameMismatch {
                expected: dns_name.to_string(),
                actual: info.common_name,
            });
        }

        let certificate = Certificate::new(info, issued.cert_pem, issued.key_pem);
        let previous_serial = {
            let mut slots = self.slots.write().await;
            match slots.get_mut(dns_name) {
                Some(slot) => slot.rotate(certificate.clone()),
                None => {
                    slots.insert(dns_name.to_string(), CertSlot::new(certificate.clone()));
                    None
                }
            }
        };

        let remaining = (certificate.info.not_after - Utc::now())
            .to_std()
            .unwrap_or_default();
        if previous_serial.is_some() {
            self.metrics.record_certificate("reissued");
            info!(
                "重新签发证书 {} (序列号 {}, 剩余有效期 {})",
                dns_name,
                certificate.serial(),
                format_duration(remaining)
            );
        } else {
            self.metrics.record_certificate("issued");
            info!(
                "签发证书 {} (序列号 {}, 剩余有效期 {})",
                dns_name,
                certificate.serial(),
                format_duration(remaining)
            );
        }

        // 没有订阅者时发送会失败，可以忽略
        let _ = self.rotations.send(CertificateRotated {
            dns_name: dns_name.to_string(),
            serial: certificate.serial().to_string(),
            previous_serial,
        });
        Ok(certificate)
    }

    /// 当前证书
    pub async fn current(&self, dns_name: &str) -> Option<Certificate> {
        self.slots
            .read()
            .await
            .get(dns_name)
            .map(|slot| slot.current.clone())
    }

    /// 验证集合：当前证书，以及轮换重叠期内仍有效的旧证书
    pub async fn verification_set(&self, dns_name: &str) -> Vec<Certificate> {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(dns_name) else {
            return Vec::new();
        };
        slot.prune();

        let mut set = vec![slot.current.clone()];
        if let Some(previous) = &slot.previous {
            set.push(previous.clone());
        }
        set
    }

    /// 证书是否仍在验证集合中且未过期
    pub async fn is_trusted(&self, dns_name: &str, serial: &str) -> bool {
        self.verification_set(dns_name)
            .await
            .iter()
            .any(|cert| cert.serial() == serial && !cert.is_expired())
    }

    /// 登记证书持有方
    pub async fn register_holder(&self, dns_name: &str, holder: &str) {
        if let Some(slot) = self.slots.write().await.get_mut(dns_name) {
            slot.holders.insert(holder.to_string());
        }
    }

    /// 注销证书持有方
    pub async fn release_holder(&self, dns_name: &str, holder: &str) {
        if let Some(slot) = self.slots.write().await.get_mut(dns_name) {
            slot.holders.remove(holder);
            slot.acknowledged.remove(holder);
            slot.prune();
        }
    }

    /// 持有方确认采用指定序列号的证书，序列号不是当前证书时返回 false
    pub async fn acknowledge(&self, dns_name: &str, holder: &str, serial: &str) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(dns_name) else {
            return false;
        };
        if slot.current.serial() != serial {
            return false;
        }
        slot.holders.insert(holder.to_string());
        slot.acknowledged.insert(holder.to_string());
        slot.prune();
        true
    }

    /// 移除 DNS 名称的全部证书（任务永久下线时）
    pub async fn forget(&self, dns_name: &str) -> bool {
        let _guard = self.locks.lock(dns_name).await;
        let removed = self.slots.write().await.remove(dns_name).is_some();
        if removed {
            info!("移除证书 {}", dns_name);
        }
        removed
    }

    /// 获取 CA 证书包
    pub async fn ca_bundle(&self) -> Result<String> {
        with_retry(&self.config.retry, "fetch_ca_bundle", || {
            with_timeout(self.timeout(), "fetch_ca_bundle", self.ca.fetch_ca_bundle())
        })
        .await
    }

    /// 执行一轮检查：重新签发所有进入安全余量的证书
    pub async fn reissue_expiring(&self) -> Vec<(String, Result<Certificate>)> {
        let margin = self.config.margin();
        let candidates: Vec<String> = {
            let mut slots = self.slots.write().await;
            slots
                .iter_mut()
                .filter_map(|(name, slot)| {
                    slot.prune();
                    Self::is_expiring_soon(&slot.current, margin).then(|| name.clone())
                })
                .collect()
        };

        let mut results = Vec::with_capacity(candidates.len());
        for dns_name in candidates {
            let _guard = self.locks.lock(&dns_name).await;
            // 持锁后再检查一次，期间可能已被请求路径重新签发或被移除
            let still_due = match self.slots.read().await.get(&dns_name) {
                Some(slot) => Self::is_expiring_soon(&slot.current, margin),
                None => false,
            };
            if !still_due {
                continue;
            }

            let result = self
                .issue_locked(&dns_name, &self.config.validity_window())
                .await;
            if let Err(e) = &result {
                warn!("重新签发证书 {} 失败: {}", dns_name, e);
            }
            results.push((dns_name, result));
        }
        results
    }

    /// 启动后台重新签发任务
    pub fn start_reissue_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let issuer = self.clone();
        let period = Duration::from_secs(self.config.check_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            info!("启动证书检查任务 (间隔 {})", format_duration(period));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("证书检查任务退出");
                        break;
                    }
                    _ = interval.tick() => {
                        let results = issuer.reissue_expiring().await;
                        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                        if failed > 0 {
                            error!("{} 个证书重新签发失败", failed);
                        } else if !results.is_empty() {
                            debug!("本轮重新签发 {} 个证书", results.len());
                        }
                    }
                }
            }
        })
    }
}
