//! 自签名 CA
//!
//! 本地 CA 使用 rcgen 生成根证书并签发叶子证书，叶子证书的主题 CN
//! 与 DNS SAN 都等于请求的名称。只为允许的 DNS 后缀签发证书。

use async_trait::async_trait;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, info};

use hdfs_guard_common::{Error, Result, ValidityWindow};

use super::{CertificateAuthority, IssuedCertificate};

/// 根证书有效期（天）
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// 自签名 CA
pub struct SelfSignedCa {
    /// 根证书参数，用于构造签发者
    root_params: CertificateParams,
    /// 根密钥
    root_key: KeyPair,
    /// 根证书（PEM 格式）
    root_pem: String,
    /// 允许签发的 DNS 后缀，为空时不限制
    allowed_suffixes: Vec<String>,
    /// 是否可达
    reachable: AtomicBool,
    /// 已签发的证书数量
    issued: AtomicU64,
}

impl SelfSignedCa {
    /// 生成新的根证书
    pub fn new(name: &str, allowed_suffixes: &[&str]) -> Result<Self> {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("生成根密钥失败: {}", e)))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| Error::Certificate(format!("构造根证书参数失败: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("HDFS Guard Root CA - {}", name));
        dn.push(DnType::OrganizationName, "HDFS Guard");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(ROOT_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let root_cert = params
            .clone()
            .self_signed(&root_key)
            .map_err(|e| Error::Certificate(format!("生成根证书失败: {}", e)))?;
        info!("生成自签名根证书: {}", name);

        Ok(Self {
            root_pem: root_cert.pem(),
            root_params: params,
            root_key,
            allowed_suffixes: normalize_suffixes(allowed_suffixes),
            reachable: AtomicBool::new(true),
            issued: AtomicU64::new(0),
        })
    }

    /// 从已有的根证书与私钥加载
    pub fn from_pem(root_cert_pem: &str, root_key_pem: &str, allowed_suffixes: &[&str]) -> Result<Self> {
        let root_key = KeyPair::from_pem(root_key_pem)
            .map_err(|e| Error::Certificate(format!("加载根密钥失败: {}", e)))?;
        let root_params = CertificateParams::from_ca_cert_pem(root_cert_pem)
            .map_err(|e| Error::Certificate(format!("加载根证书失败: {}", e)))?;

        Ok(Self {
            root_params,
            root_key,
            root_pem: root_cert_pem.to_string(),
            allowed_suffixes: normalize_suffixes(allowed_suffixes),
            reachable: AtomicBool::new(true),
            issued: AtomicU64::new(0),
        })
    }

    /// 根证书（PEM 格式）
    pub fn root_cert_pem(&self) -> &str {
        &self.root_pem
    }

    /// 根私钥（PEM 格式），用于持久化
    pub fn root_key_pem(&self) -> String {
        self.root_key.serialize_pem()
    }

    /// 切换可达状态
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// 已签发的证书数量
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed_suffixes.is_empty()
            || self
                .allowed_suffixes
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str()) && name.len() > suffix.len())
    }

    fn sign(&self, common_name: &str, validity: &ValidityWindow) -> Result<IssuedCertificate> {
        let failed = |e: rcgen::Error| Error::Certificate(format!("签发 {} 失败: {}", common_name, e));

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(failed)?;
        let mut params = CertificateParams::new(vec![common_name.to_string()]).map_err(|e| {
            Error::CertificateDenied {
                name: common_name.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.not_before = to_offset(validity.not_before)?;
        params.not_after = to_offset(validity.not_after)?;
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let issuer = Issuer::from_params(&self.root_params, &self.root_key);
        let cert = params.signed_by(&key_pair, &issuer).map_err(failed)?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

impl fmt::Debug for SelfSignedCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfSignedCa")
            .field("allowed_suffixes", &self.allowed_suffixes)
            .field("issued", &self.issued_count())
            .finish()
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedCa {
    async fn issue_certificate(
        &self,
        common_name: &str,
        validity: &ValidityWindow,
    ) -> Result<IssuedCertificate> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::CaUnreachable("self-signed".to_string()));
        }
        if !self.is_allowed(common_name) {
            return Err(Error::CertificateDenied {
                name: common_name.to_string(),
                reason: "名称不在允许的 DNS 后缀范围内".to_string(),
            });
        }
        if validity.not_after <= validity.not_before {
            return Err(Error::CertificateDenied {
                name: common_name.to_string(),
                reason: "有效期窗口为空".to_string(),
            });
        }

        let issued = self.sign(common_name, validity)?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        debug!("签发证书: {}", common_name);
        Ok(issued)
    }

    async fn fetch_ca_bundle(&self) -> Result<String> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::CaUnreachable("self-signed".to_string()));
        }
        Ok(self.root_pem.clone())
    }
}

fn normalize_suffixes(suffixes: &[&str]) -> Vec<String> {
    suffixes
        .iter()
        .map(|s| format!(".{}", s.trim_start_matches('.')))
        .collect()
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // 序列号必须为正数
    bytes[0] &= 0x7f;
    bytes[0] |= 0x01;
    SerialNumber::from_slice(&bytes)
}

fn to_offset(at: chrono::DateTime<chrono::Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::Certificate(format!("无效的时间: {}", e)))
}
