//! 存储引擎授权钩子
//!
//! 每个文件系统操作先把 Kerberos 主体解析为本地用户，再按 POSIX 风格的
//! owner/group/other 权限位检查。主体没有映射时直接拒绝，不回退到任何
//! 隐式身份。拒绝信息的格式与 HDFS NameNode 一致。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use hdfs_guard_common::{Error, Result};

use crate::mapping::{AuthMappingResolver, Resolution};

/// 访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    fn bit(self) -> u16 {
        match self {
            Access::Read => 0o4,
            Access::Write => 0o2,
            Access::Execute => 0o1,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "READ",
            Access::Write => "WRITE",
            Access::Execute => "EXECUTE",
        })
    }
}

/// 被访问的 inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub owner: String,
    pub group: String,
    /// 权限位，如 0o700
    pub mode: u16,
    pub is_dir: bool,
}

impl FileStatus {
    /// 目录
    pub fn directory(path: &str, owner: &str, group: &str, mode: u16) -> Self {
        Self {
            path: path.to_string(),
            owner: owner.to_string(),
            group: group.to_string(),
            mode,
            is_dir: true,
        }
    }

    /// 文件
    pub fn file(path: &str, owner: &str, group: &str, mode: u16) -> Self {
        Self {
            is_dir: false,
            ..Self::directory(path, owner, group, mode)
        }
    }

    /// `drwx------` 形式的权限字符串
    pub fn permission_string(&self) -> String {
        let mut s = String::with_capacity(10);
        s.push(if self.is_dir { 'd' } else { '-' });
        for shift in [6u16, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        s
    }
}

/// 授权钩子
pub struct AuthorizationHook {
    resolver: Arc<AuthMappingResolver>,
    /// 用户所属的组
    groups: HashMap<String, HashSet<String>>,
}

impl AuthorizationHook {
    /// 创建授权钩子
    pub fn new(resolver: Arc<AuthMappingResolver>) -> Self {
        Self {
            resolver,
            groups: HashMap::new(),
        }
    }

    /// 登记用户所属的组
    pub fn with_group(mut self, user: &str, group: &str) -> Self {
        self.groups
            .entry(user.to_string())
            .or_default()
            .insert(group.to_string());
        self
    }

    fn in_group(&self, user: &str, group: &str) -> bool {
        self.groups
            .get(user)
            .map(|groups| groups.contains(group))
            .unwrap_or(false)
    }

    /// 检查主体对 inode 的访问权限，允许时返回解析出的用户名
    pub fn check(&self, principal: &str, status: &FileStatus, access: Access) -> Result<String> {
        let (username, superuser) = match self.resolver.resolve(principal) {
            Resolution::Mapped {
                username,
                superuser,
            } => (username, superuser),
            Resolution::Unmapped => return Err(Error::Unmapped(principal.to_string())),
        };

        if superuser {
            debug!("超级用户 {} 访问 {}", username, status.path);
            return Ok(username);
        }

        let shift = if status.owner == username {
            6
        } else if self.in_group(&username, &status.group) {
            3
        } else {
            0
        };
        if (status.mode >> shift) & access.bit() != 0 {
            return Ok(username);
        }

        warn!("拒绝 {} 对 {} 的 {} 访问", username, status.path, access);
        Err(Error::PermissionDenied(format!(
            "user={}, access={}, inode=\"{}\":{}:{}:{}",
            username,
            access,
            status.path,
            status.owner,
            status.group,
            status.permission_string()
        )))
    }
}
