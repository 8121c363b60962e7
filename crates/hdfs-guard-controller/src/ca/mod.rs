//! CA 协作方模块
//!
//! CA 签发与任务 DNS 名称绑定的叶子证书，并提供用于验证对端的
//! CA 证书包。证书元数据一律从 PEM 中解析，不信任 CA 响应里的描述。

mod self_signed;

pub use self_signed::SelfSignedCa;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use hdfs_guard_common::{CertificateInfo, Error, Result, ValidityWindow};

/// CA 返回的证书与私钥
#[derive(Clone)]
pub struct IssuedCertificate {
    /// 证书（PEM 格式）
    pub cert_pem: String,
    /// 私钥（PEM 格式）
    pub key_pem: String,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_pem", &format_args!("<{} bytes>", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// CA 客户端接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// 为指定 CN 签发证书
    async fn issue_certificate(
        &self,
        common_name: &str,
        validity: &ValidityWindow,
    ) -> Result<IssuedCertificate>;

    /// 获取 CA 证书包（PEM 格式）
    async fn fetch_ca_bundle(&self) -> Result<String>;
}

/// 解析 PEM 证书的元数据
pub fn parse_certificate(cert_pem: &str) -> Result<CertificateInfo> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("PEM 解析失败: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("X.509 解析失败: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Error::Certificate("证书缺少 CN".to_string()))?
        .to_string();

    let validity = cert.validity();
    Ok(CertificateInfo {
        common_name,
        serial: cert.tbs_certificate.raw_serial_as_string(),
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
    })
}

/// 解析证书中的 DNS SAN
pub fn dns_names(cert_pem: &str) -> Result<Vec<String>> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("PEM 解析失败: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("X.509 解析失败: {}", e)))?;

    let names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => return Err(Error::Certificate(format!("SAN 扩展无效: {}", e))),
    };
    Ok(names)
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::Certificate(format!("无效的时间戳: {}", secs)))
}
