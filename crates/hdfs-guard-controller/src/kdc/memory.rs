//! 进程内 KDC
//!
//! 为开发环境和测试提供的 KDC 实现。每个主体持有随机密钥和递增的
//! 密钥版本号（kvno），导出的 keytab 编码了版本号与密钥，
//! 试认证时与当前密钥比较。

use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use hdfs_guard_common::{Error, Result};

use super::{KdcClient, PrincipalCreation};

/// keytab 格式版本
const KEYTAB_VERSION: [u8; 2] = [0x05, 0x02];
/// 密钥长度
const KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
struct PrincipalEntry {
    owner: Option<String>,
    kvno: u32,
    key: [u8; KEY_LEN],
}

/// 进程内 KDC
#[derive(Debug)]
pub struct MemoryKdc {
    /// Kerberos 域
    realm: String,
    /// 主体数据库
    principals: RwLock<HashMap<String, PrincipalEntry>>,
    /// 是否可达
    reachable: AtomicBool,
    /// 接下来需要以不可达失败的请求数
    fail_next: AtomicU32,
}

impl MemoryKdc {
    /// 创建进程内 KDC
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            principals: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Kerberos 域
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// 切换可达状态
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// 让接下来的 `count` 个请求以不可达失败
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// 预先登记一个主体，模拟由其他实体创建的主体
    pub async fn preexisting(&self, principal: &str, owner: Option<&str>) {
        let mut principals = self.principals.write().await;
        principals.insert(
            principal.to_string(),
            PrincipalEntry {
                owner: owner.map(str::to_string),
                kvno: 1,
                key: random_key(),
            },
        );
    }

    /// 主体是否存在
    pub async fn contains(&self, principal: &str) -> bool {
        self.principals.read().await.contains_key(principal)
    }

    /// 主体数量
    pub async fn principal_count(&self) -> usize {
        self.principals.read().await.len()
    }

    /// 主体当前的密钥版本号
    pub async fn kvno(&self, principal: &str) -> Option<u32> {
        self.principals.read().await.get(principal).map(|e| e.kvno)
    }

    fn check_reachable(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::KdcUnreachable(format!("kdc.{}", self.realm)));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(Error::KdcUnreachable(format!("kdc.{}", self.realm)));
        }
        Ok(())
    }

    fn check_realm(&self, principal: &str) -> Result<()> {
        match principal.rsplit_once('@') {
            Some((_, realm)) if realm == self.realm => Ok(()),
            _ => Err(Error::Kdc(format!("主体 {} 不属于域 {}", principal, self.realm))),
        }
    }
}

#[async_trait]
impl KdcClient for MemoryKdc {
    async fn create_principal(&self, principal: &str, owner: &str) -> Result<PrincipalCreation> {
        self.check_reachable()?;
        self.check_realm(principal)?;

        let mut principals = self.principals.write().await;
        if let Some(entry) = principals.get(principal) {
            debug!("主体已存在: {}", principal);
            return Ok(PrincipalCreation::Exists {
                owner: entry.owner.clone(),
            });
        }

        principals.insert(
            principal.to_string(),
            PrincipalEntry {
                owner: Some(owner.to_string()),
                kvno: 1,
                key: random_key(),
            },
        );
        info!("创建主体: {}", principal);
        Ok(PrincipalCreation::Created)
    }

    async fn get_keytab(&self, principal: &str) -> Result<Vec<u8>> {
        self.check_reachable()?;

        let mut principals = self.principals.write().await;
        let entry = principals
            .get_mut(principal)
            .ok_or_else(|| Error::Kdc(format!("主体不存在: {}", principal)))?;

        // 与 ktadd 一致，每次导出都会随机化密钥
        entry.kvno += 1;
        entry.key = random_key();
        Ok(encode_keytab(principal, entry.kvno, &entry.key))
    }

    async fn authenticate(&self, principal: &str, keytab: &[u8]) -> Result<()> {
        self.check_reachable()?;

        let (name, kvno, key) = decode_keytab(keytab)
            .ok_or_else(|| Error::Authentication(format!("{} 的 keytab 格式无效", principal)))?;
        if name != principal {
            return Err(Error::Authentication(format!(
                "keytab 不包含主体 {}",
                principal
            )));
        }

        let principals = self.principals.read().await;
        let entry = principals
            .get(principal)
            .ok_or_else(|| Error::Authentication(format!("主体不存在: {}", principal)))?;
        if entry.kvno != kvno || entry.key[..] != key[..] {
            return Err(Error::Authentication(format!(
                "{} 的密钥版本已过期 (kvno {})",
                principal, kvno
            )));
        }
        Ok(())
    }

    async fn delete_principal(&self, principal: &str) -> Result<()> {
        self.check_reachable()?;
        if self.principals.write().await.remove(principal).is_some() {
            info!("删除主体: {}", principal);
        }
        Ok(())
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn encode_keytab(principal: &str, kvno: u32, key: &[u8; KEY_LEN]) -> Vec<u8> {
    let name = principal.as_bytes();
    let mut bytes = Vec::with_capacity(2 + 4 + 2 + name.len() + KEY_LEN);
    bytes.extend_from_slice(&KEYTAB_VERSION);
    bytes.extend_from_slice(&kvno.to_be_bytes());
    bytes.extend_from_slice(&(name.len() as u16).to_be_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(key);
    bytes
}

fn decode_keytab(bytes: &[u8]) -> Option<(String, u32, [u8; KEY_LEN])> {
    if bytes.get(0..2)? != &KEYTAB_VERSION[..] {
        return None;
    }
    let kvno = u32::from_be_bytes(bytes.get(2..6)?.try_into().ok()?);
    let name_len = u16::from_be_bytes(bytes.get(6..8)?.try_into().ok()?) as usize;
    let name = std::str::from_utf8(bytes.get(8..8 + name_len)?).ok()?;
    let key: [u8; KEY_LEN] = bytes.get(8 + name_len..)?.try_into().ok()?;
    Some((name.to_string(), kvno, key))
}
