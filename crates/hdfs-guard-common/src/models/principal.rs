//! Kerberos 主体模型
//!
//! 服务主体采用 `primary/instance@REALM` 形式，其中 instance 是任务的
//! 稳定 DNS 名称，因此角色与实例序号都编码在主体字符串里。
//! 客户端主体是固定身份 `name@REALM`。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::task::TaskIdentity;
use crate::models::topology::Role;

/// 主体归属
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrincipalKind {
    /// 某个节点任务的服务主体
    Service { role: Role, index: u32 },
    /// 不绑定任务的固定身份
    Client,
}

/// Kerberos 主体
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    /// primary 部分，如 hdfs、HTTP、alice
    pub primary: String,
    /// instance 部分，服务主体为任务 DNS 名称
    pub instance: Option<String>,
    /// Kerberos 域
    pub realm: String,
    /// 主体归属
    pub kind: PrincipalKind,
}

impl Principal {
    /// 为任务创建服务主体
    pub fn service(primary: &str, task: &TaskIdentity, realm: &str) -> Self {
        Self {
            primary: primary.to_string(),
            instance: Some(task.dns_name()),
            realm: realm.to_string(),
            kind: PrincipalKind::Service {
                role: task.role,
                index: task.index,
            },
        }
    }

    /// 创建客户端主体
    pub fn client(name: &str, realm: &str) -> Self {
        Self {
            primary: name.to_string(),
            instance: None,
            realm: realm.to_string(),
            kind: PrincipalKind::Client,
        }
    }

    /// 主体的完整字符串形式
    pub fn name(&self) -> String {
        match &self.instance {
            Some(instance) => format!("{}/{}@{}", self.primary, instance, self.realm),
            None => format!("{}@{}", self.primary, self.realm),
        }
    }

    /// 不含域的组成部分，用于映射规则的 `$1`、`$2`
    pub fn components(&self) -> Vec<&str> {
        let mut components = vec![self.primary.as_str()];
        if let Some(instance) = &self.instance {
            components.push(instance.as_str());
        }
        components
    }

    /// 拥有该主体的任务 ID，客户端主体返回 None
    pub fn task_id(&self) -> Option<&str> {
        match self.kind {
            PrincipalKind::Service { .. } => self
                .instance
                .as_deref()
                .and_then(|instance| instance.split('.').next()),
            PrincipalKind::Client => None,
        }
    }

    /// 是否属于指定任务
    pub fn belongs_to(&self, task: &TaskIdentity) -> bool {
        match self.kind {
            PrincipalKind::Service { role, index } => {
                role == task.role
                    && index == task.index
                    && self.instance.as_deref() == Some(task.dns_name().as_str())
            }
            PrincipalKind::Client => false,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Principal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (components, realm) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::InvalidTopology(format!("主体缺少域: {}", s)))?;
        if realm.is_empty() || components.is_empty() {
            return Err(Error::InvalidTopology(format!("无效的主体: {}", s)));
        }

        let Some((primary, instance)) = components.split_once('/') else {
            return Ok(Self::client(components, realm));
        };
        if primary.is_empty() || instance.is_empty() || instance.contains('/') {
            return Err(Error::InvalidTopology(format!("无效的主体: {}", s)));
        }

        let kind = instance
            .split_once('.')
            .and_then(|(task_id, service)| TaskIdentity::parse(task_id, service).ok())
            .map(|task| PrincipalKind::Service {
                role: task.role,
                index: task.index,
            })
            .unwrap_or(PrincipalKind::Client);

        Ok(Self {
            primary: primary.to_string(),
            instance: Some(instance.to_string()),
            realm: realm.to_string(),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_service_principal_name() {
        let task = TaskIdentity::new("hdfs", Role::Name, 0);
        let principal = Principal::service("hdfs", &task, "LOCAL");
        assert_eq!(principal.name(), "hdfs/name-0-node.hdfs@LOCAL");
        assert_eq!(principal.task_id(), Some("name-0-node"));
        assert!(principal.belongs_to(&task));
        assert!(!principal.belongs_to(&TaskIdentity::new("hdfs", Role::Name, 1)));
    }

    #[test]
    fn test_client_principal_name() {
        let principal = Principal::client("alice", "LOCAL");
        assert_eq!(principal.name(), "alice@LOCAL");
        assert_eq!(principal.components(), vec!["alice"]);
        assert_eq!(principal.task_id(), None);
    }

    #[test]
    fn test_parse_service_principal() {
        let principal: Principal = "HTTP/data-1-node.hdfs@LOCAL".parse().unwrap();
        assert_eq!(principal.primary, "HTTP");
        assert_eq!(
            principal.kind,
            PrincipalKind::Service {
                role: Role::Data,
                index: 1
            }
        );
        assert_eq!(principal.to_string(), "HTTP/data-1-node.hdfs@LOCAL");
    }

    #[rstest]
    #[case("alice")]
    #[case("@LOCAL")]
    #[case("alice@")]
    #[case("a/b/c@LOCAL")]
    #[case("/data-0-node.hdfs@LOCAL")]
    #[case("hdfs/@LOCAL")]
    fn test_parse_malformed_principal(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Principal>(),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_parse_external_principal() {
        let principal: Principal = "HTTP/gateway.example.com@LOCAL".parse().unwrap();
        assert_eq!(principal.kind, PrincipalKind::Client);
        assert!("alice".parse::<Principal>().is_err());
        assert!("a/b/c@LOCAL".parse::<Principal>().is_err());
    }
}
