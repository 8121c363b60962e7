//! 凭据材料模型
//!
//! keytab 与证书私钥都是敏感材料，`Debug` 输出只包含元数据。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kerberos keytab
#[derive(Clone, PartialEq, Eq)]
pub struct Keytab {
    /// 所属主体
    principal: String,
    /// 原始 keytab 内容
    bytes: Vec<u8>,
}

impl Keytab {
    /// 创建 keytab
    pub fn new(principal: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            principal: principal.into(),
            bytes,
        }
    }

    /// 所属主体
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// keytab 内容
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// keytab 长度
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// keytab 是否为空
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Keytab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keytab")
            .field("principal", &self.principal)
            .field("bytes", &format_args!("<{} bytes redacted>", self.bytes.len()))
            .finish()
    }
}

/// 证书有效期窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// 生效时间
    pub not_before: DateTime<Utc>,
    /// 失效时间
    pub not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// 从当前时间开始、持续指定时长的窗口
    pub fn starting_now(duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            not_before: now,
            not_after: now + duration,
        }
    }
}

/// 从证书中解析出的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    /// 主题 CN
    pub common_name: String,
    /// 序列号（十六进制）
    pub serial: String,
    /// 生效时间
    pub not_before: DateTime<Utc>,
    /// 失效时间
    pub not_after: DateTime<Utc>,
}

/// 绑定到任务 DNS 名称的 TLS 证书
#[derive(Clone)]
pub struct Certificate {
    /// 元数据
    pub info: CertificateInfo,
    /// 证书（PEM 格式）
    pub cert_pem: String,
    /// 私钥（PEM 格式）
    key_pem: String,
}

impl Certificate {
    /// 创建证书
    pub fn new(info: CertificateInfo, cert_pem: String, key_pem: String) -> Self {
        Self {
            info,
            cert_pem,
            key_pem,
        }
    }

    /// 私钥（PEM 格式）
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// 主题 CN
    pub fn common_name(&self) -> &str {
        &self.info.common_name
    }

    /// 序列号
    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    /// 检查证书在指定时间是否有效
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.info.not_before && now < self.info.not_after
    }

    /// 检查证书是否已过期
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.info.not_after
    }

    /// 检查证书是否在安全余量内即将过期
    pub fn is_expiring_soon(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now + margin >= self.info.not_after
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("info", &self.info)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}
