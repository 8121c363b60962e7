//! 密钥存储模块
//!
//! 密钥存储是按能力授权的键值存储：每个条目记录有权读取它的请求方，
//! 其他请求方读取时返回 [`Error::AccessDenied`]。

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use hdfs_guard_common::{Error, Result};

/// 控制平面自身的请求方标识，可读取所有条目
pub const CONTROLLER_SCOPE: &str = "hdfs-guard-controller";

/// 客户端身份的请求方标识
pub const CLIENT_SCOPE: &str = "hdfs-guard-clients";

/// 密钥存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// 写入条目，覆盖同名条目
    async fn put(&self, key: &str, value: Vec<u8>, entitled: &[String]) -> Result<()>;

    /// 以指定请求方身份读取条目
    async fn get(&self, key: &str, requester: &str) -> Result<Option<Vec<u8>>>;

    /// 删除条目，返回条目是否存在
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// 存储条目
#[derive(Clone)]
struct SecretEntry {
    value: Vec<u8>,
    entitled: Vec<String>,
}

impl SecretEntry {
    fn permits(&self, requester: &str) -> bool {
        requester == CONTROLLER_SCOPE || self.entitled.iter().any(|e| e == requester)
    }
}

/// 内存密钥存储
///
/// 条目以 `Arc` 整体替换，读取方拿到的总是完整的旧值或新值。
#[derive(Default, Clone)]
pub struct MemorySecretStore {
    entries: Arc<RwLock<HashMap<String, Arc<SecretEntry>>>>,
}

impl MemorySecretStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 条目数量
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 存储是否为空
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 所有条目的键
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySecretStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put(&self, key: &str, value: Vec<u8>, entitled: &[String]) -> Result<()> {
        let entry = Arc::new(SecretEntry {
            value,
            entitled: entitled.to_vec(),
        });
        self.entries.write().await.insert(key.to_string(), entry);
        debug!("写入密钥条目: {}", key);
        Ok(())
    }

    async fn get(&self, key: &str, requester: &str) -> Result<Option<Vec<u8>>> {
        let entry = match self.entries.read().await.get(key) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };

        if !entry.permits(requester) {
            warn!("拒绝 {} 读取密钥条目 {}", requester, key);
            return Err(Error::AccessDenied {
                key: key.to_string(),
                requester: requester.to_string(),
            });
        }
        Ok(Some(entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            debug!("删除密钥条目: {}", key);
        }
        Ok(removed)
    }
}
