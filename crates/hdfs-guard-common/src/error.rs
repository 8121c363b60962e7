//! 错误处理模块
//!
//! 该模块提供 HDFS Guard 项目的统一错误类型。每个错误都归入一个
//! [`ErrorClass`]，身份绑定状态机据此决定重试、升级或直接拒绝。

use std::io;
use thiserror::Error;

/// HDFS Guard 统一错误类型
///
/// 错误信息中不得包含 keytab 或私钥内容。
#[derive(Error, Debug)]
pub enum Error {
    /// 拓扑无效
    #[error("拓扑无效: {0}")]
    InvalidTopology(String),

    /// KDC 不可达
    #[error("KDC 不可达: {0}")]
    KdcUnreachable(String),

    /// KDC 拒绝了请求
    #[error("KDC 拒绝请求: {0}")]
    Kdc(String),

    /// CA 不可达
    #[error("CA 不可达: {0}")]
    CaUnreachable(String),

    /// 主体已被其他实体占用
    #[error("主体 {principal} 已被 {owner} 占用")]
    PrincipalConflict { principal: String, owner: String },

    /// 证书申请被拒绝
    #[error("证书申请被拒绝 {name}: {reason}")]
    CertificateDenied { name: String, reason: String },

    /// 证书 CN 与任务身份不一致
    #[error("证书名称不匹配: 期望 {expected}, 实际 {actual}")]
    NameMismatch { expected: String, actual: String },

    /// 证书无法解析
    #[error("证书解析失败: {0}")]
    Certificate(String),

    /// 凭据已被另一个存活任务绑定
    #[error("凭据 {credential} 已绑定到 {holder}")]
    CredentialInUse { credential: String, holder: String },

    /// 主体没有匹配的映射规则
    #[error("主体没有匹配的映射规则: {0}")]
    Unmapped(String),

    /// 映射规则无效
    #[error("映射规则无效: {0}")]
    InvalidRule(String),

    /// 存储引擎权限检查失败，格式与 HDFS 一致
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// 请求方无权读取密钥
    #[error("无权访问密钥 {key}: 请求方 {requester}")]
    AccessDenied { key: String, requester: String },

    /// 密钥不存在
    #[error("密钥不存在: {0}")]
    SecretNotFound(String),

    /// Kerberos 试认证失败
    #[error("身份验证错误: {0}")]
    Authentication(String),

    /// TLS 握手失败
    #[error("TLS 握手失败: {0}")]
    Handshake(String),

    /// 任务尚未就绪
    #[error("任务未就绪: {0}")]
    NotReady(String),

    /// 操作超时
    #[error("操作超时: {0}")]
    Timeout(String),

    /// 操作已取消
    #[error("操作已取消")]
    Cancelled,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// Kubernetes API 错误
    #[error("Kubernetes 错误: {0}")]
    Kube(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 暂时性错误，使用带抖动的指数退避重试
    Transient,
    /// 名称或主体已被他人占用，需要运维介入
    Conflict,
    /// 证书或映射不一致，失败即关闭
    Mismatch,
    /// 授权解析失败，只拒绝当前操作
    Unmapped,
    /// 其他不可重试的错误
    Fatal,
}

impl Error {
    /// 获取错误分类
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KdcUnreachable(_)
            | Error::CaUnreachable(_)
            | Error::CredentialInUse { .. }
            | Error::Authentication(_)
            | Error::Handshake(_)
            | Error::NotReady(_)
            | Error::Timeout(_)
            | Error::Kube(_)
            | Error::Io(_) => ErrorClass::Transient,
            Error::PrincipalConflict { .. } => ErrorClass::Conflict,
            Error::NameMismatch { .. }
            | Error::CertificateDenied { .. }
            | Error::AccessDenied { .. } => ErrorClass::Mismatch,
            Error::Unmapped(_) | Error::PermissionDenied(_) => ErrorClass::Unmapped,
            Error::InvalidTopology(_)
            | Error::Kdc(_)
            | Error::Certificate(_)
            | Error::InvalidRule(_)
            | Error::SecretNotFound(_)
            | Error::Cancelled
            | Error::Config(_)
            | Error::Json(_) => ErrorClass::Fatal,
        }
    }

    /// 是否可以重试
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// HDFS Guard 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::KdcUnreachable("kdc:88".into()).is_retryable());
        assert!(Error::CaUnreachable("ca".into()).is_retryable());
        assert!(Error::Timeout("getKeytab".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        let conflict = Error::PrincipalConflict {
            principal: "hdfs/name-0-node.hdfs@LOCAL".into(),
            owner: "other".into(),
        };
        assert_eq!(conflict.class(), ErrorClass::Conflict);
        assert!(!conflict.is_retryable());

        let mismatch = Error::NameMismatch {
            expected: "name-0-node.hdfs".into(),
            actual: "name-1-node.hdfs".into(),
        };
        assert_eq!(mismatch.class(), ErrorClass::Mismatch);
        assert!(!mismatch.is_retryable());
    }

    #[test]
    fn test_permission_denied_message_matches_hdfs() {
        let err = Error::PermissionDenied("user=bob, access=WRITE".into());
        assert_eq!(err.to_string(), "Permission denied: user=bob, access=WRITE");
        assert_eq!(err.class(), ErrorClass::Unmapped);
    }
}
