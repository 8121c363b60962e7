//! KDC 协作方模块
//!
//! 控制平面把 KDC 当作不透明服务使用：只发起请求并解析成功/失败。
//! 包含基于 kadmin 命令行的生产实现和进程内实现。

mod kadmin;
mod memory;

pub use kadmin::{KadminCommand, KadminKdc, KadminRunner};
pub use memory::MemoryKdc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use hdfs_guard_common::Result;

/// 创建主体的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalCreation {
    /// 新建成功
    Created,
    /// 主体已存在，附带 KDC 记录的归属（若有）
    Exists { owner: Option<String> },
}

/// KDC 客户端接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KdcClient: Send + Sync {
    /// 创建主体，`owner` 记录在主体的注释中
    async fn create_principal(&self, principal: &str, owner: &str) -> Result<PrincipalCreation>;

    /// 导出主体的 keytab
    async fn get_keytab(&self, principal: &str) -> Result<Vec<u8>>;

    /// 使用 keytab 向 KDC 做一次试认证
    async fn authenticate(&self, principal: &str, keytab: &[u8]) -> Result<()>;

    /// 删除主体
    async fn delete_principal(&self, principal: &str) -> Result<()>;
}

/// KDC 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdcConfig {
    /// KDC 主机
    pub host: String,
    /// KDC 端口
    pub port: u16,
    /// Kerberos 域
    pub realm: String,
    /// kadmin 使用的管理员主体
    pub admin_principal: String,
    /// 管理员 keytab 路径
    pub admin_keytab: String,
    /// kadmin 可执行文件
    pub kadmin_path: String,
    /// kinit 可执行文件
    pub kinit_path: String,
    /// krb5.conf 路径，为空时使用系统默认
    pub krb5_config: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 导出 keytab 的临时目录，为空时使用系统临时目录
    pub scratch_dir: Option<PathBuf>,
}

impl Default for KdcConfig {
    fn default() -> Self {
        Self {
            host: "kdc.kerberos.svc.cluster.local".to_string(),
            port: 88,
            realm: "LOCAL".to_string(),
            admin_principal: "kadmin/admin@LOCAL".to_string(),
            admin_keytab: "/etc/hdfs-guard/kadmin.keytab".to_string(),
            kadmin_path: "kadmin".to_string(),
            kinit_path: "kinit".to_string(),
            krb5_config: None,
            request_timeout_secs: 30,
            scratch_dir: None,
        }
    }
}

impl KdcConfig {
    /// KDC 地址
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
