//! 服务拓扑模型
//!
//! 该模块描述一个多角色 HDFS 服务的部署拓扑：服务名、Kerberos 域、
//! 每个节点角色的实例数以及固定的客户端身份。拓扑一经接受即不可变，
//! 扩缩容通过生成新拓扑完成。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::task::TaskIdentity;

/// 服务角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// JournalNode
    Journal,
    /// NameNode
    Name,
    /// DataNode
    Data,
    /// 客户端身份
    Client,
}

impl Role {
    /// 所有节点角色
    pub const NODE_ROLES: [Role; 3] = [Role::Journal, Role::Name, Role::Data];

    /// 角色名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Journal => "journal",
            Role::Name => "name",
            Role::Data => "data",
            Role::Client => "client",
        }
    }

    /// 是否为调度到集群中的节点角色
    pub fn is_node(&self) -> bool {
        !matches!(self, Role::Client)
    }

    /// 默认 HTTPS 端口
    pub fn default_https_port(&self) -> Option<u16> {
        match self {
            Role::Journal => Some(8481),
            Role::Name => Some(9003),
            Role::Data => Some(9006),
            Role::Client => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "journal" => Ok(Role::Journal),
            "name" => Ok(Role::Name),
            "data" => Ok(Role::Data),
            "client" => Ok(Role::Client),
            _ => Err(Error::InvalidTopology(format!("未知角色: {}", s))),
        }
    }
}

/// 单个角色的实例配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// 角色
    pub role: Role,
    /// 实例数
    pub instances: u32,
    /// 是否至少需要一个实例
    #[serde(default = "default_required")]
    pub required: bool,
}

/// 服务拓扑
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTopology {
    /// 服务名称，同时作为任务 DNS 名称的后缀
    pub name: String,
    /// Kerberos 域
    pub realm: String,
    /// 每个节点实例需要的 Kerberos primary 列表
    #[serde(default = "default_primaries")]
    pub primaries: Vec<String>,
    /// 节点角色
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    /// 固定客户端身份
    #[serde(default)]
    pub clients: Vec<String>,
}

impl ServiceTopology {
    /// 创建空拓扑
    pub fn new(name: &str, realm: &str) -> Self {
        Self {
            name: name.to_string(),
            realm: realm.to_string(),
            primaries: default_primaries(),
            roles: Vec::new(),
            clients: Vec::new(),
        }
    }

    /// 添加必需角色
    pub fn with_role(mut self, role: Role, instances: u32) -> Self {
        self.set_instances(role, instances, true);
        self
    }

    /// 添加可为零实例的角色
    pub fn with_optional_role(mut self, role: Role, instances: u32) -> Self {
        self.set_instances(role, instances, false);
        self
    }

    /// 添加客户端身份
    pub fn with_client(mut self, name: &str) -> Self {
        self.clients.push(name.to_string());
        self
    }

    /// 替换 primary 列表
    pub fn with_primaries(mut self, primaries: &[&str]) -> Self {
        self.primaries = primaries.iter().map(|p| p.to_string()).collect();
        self
    }

    /// 生成某个角色改变实例数后的新拓扑
    pub fn scaled(&self, role: Role, instances: u32) -> Self {
        let mut next = self.clone();
        let required = self
            .roles
            .iter()
            .find(|spec| spec.role == role)
            .map(|spec| spec.required)
            .unwrap_or(true);
        next.set_instances(role, instances, required);
        next
    }

    /// 角色的实例数，客户端角色返回客户端身份数量
    pub fn instances(&self, role: Role) -> u32 {
        if role == Role::Client {
            return self.clients.len() as u32;
        }
        self.roles
            .iter()
            .find(|spec| spec.role == role)
            .map(|spec| spec.instances)
            .unwrap_or(0)
    }

    /// 拓扑中所有节点任务
    pub fn tasks(&self) -> Vec<TaskIdentity> {
        let mut tasks = Vec::new();
        for role in Role::NODE_ROLES {
            for index in 0..self.instances(role) {
                tasks.push(TaskIdentity::new(&self.name, role, index));
            }
        }
        tasks
    }

    /// 任务是否属于该拓扑
    pub fn contains_task(&self, task: &TaskIdentity) -> bool {
        task.service_name == self.name
            && task.role.is_node()
            && task.index < self.instances(task.role)
    }

    /// 校验拓扑
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.name) {
            return Err(Error::InvalidTopology(format!(
                "服务名称必须是合法的 DNS 标签: {:?}",
                self.name
            )));
        }

        if self.realm.is_empty() || self.realm.contains(&['@', '/'][..]) {
            return Err(Error::InvalidTopology(format!("无效的 Kerberos 域: {:?}", self.realm)));
        }

        if self.primaries.is_empty() {
            return Err(Error::InvalidTopology("primary 列表不能为空".to_string()));
        }
        for primary in &self.primaries {
            if !is_component(primary) {
                return Err(Error::InvalidTopology(format!("无效的 primary: {:?}", primary)));
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.roles {
            if !spec.role.is_node() {
                return Err(Error::InvalidTopology(
                    "客户端身份必须通过 clients 声明".to_string(),
                ));
            }
            if !seen.insert(spec.role) {
                return Err(Error::InvalidTopology(format!("角色 {} 重复声明", spec.role)));
            }
            if spec.required && spec.instances == 0 {
                return Err(Error::InvalidTopology(format!(
                    "角色 {} 至少需要一个实例",
                    spec.role
                )));
            }
        }

        // NameNode 主体是必需的
        if self.instances(Role::Name) == 0 {
            return Err(Error::InvalidTopology("至少需要一个 name 节点".to_string()));
        }

        let mut clients = HashSet::new();
        for client in &self.clients {
            if !is_component(client) {
                return Err(Error::InvalidTopology(format!("无效的客户端身份: {:?}", client)));
            }
            if !clients.insert(client.as_str()) {
                return Err(Error::InvalidTopology(format!("客户端身份 {} 重复声明", client)));
            }
        }

        Ok(())
    }

    fn set_instances(&mut self, role: Role, instances: u32, required: bool) {
        match self.roles.iter_mut().find(|spec| spec.role == role) {
            Some(spec) => {
                spec.instances = instances;
                spec.required = required;
            }
            None => self.roles.push(RoleSpec {
                role,
                instances,
                required,
            }),
        }
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn is_component(s: &str) -> bool {
    !s.is_empty() && !s.contains(&['@', '/', ' ', '\t', '\n'][..])
}

/// 默认 primary 列表
fn default_primaries() -> Vec<String> {
    vec!["hdfs".to_string()]
}

/// 默认角色为必需
fn default_required() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> ServiceTopology {
        ServiceTopology::new("hdfs", "LOCAL")
            .with_role(Role::Journal, 3)
            .with_role(Role::Name, 2)
            .with_role(Role::Data, 3)
            .with_client("hdfs")
            .with_client("alice")
            .with_client("bob")
    }

    #[test]
    fn test_valid_topology() {
        let topology = topology();
        assert!(topology.validate().is_ok());
        assert_eq!(topology.tasks().len(), 8);
        assert_eq!(topology.instances(Role::Client), 3);
    }

    #[test]
    fn test_name_node_is_mandatory() {
        let topology = ServiceTopology::new("hdfs", "LOCAL").with_optional_role(Role::Name, 0);
        assert!(matches!(topology.validate(), Err(Error::InvalidTopology(_))));
    }

    #[test]
    fn test_required_role_with_zero_instances() {
        let topology = topology().scaled(Role::Data, 0);
        assert!(topology.validate().is_err());

        let optional = ServiceTopology::new("hdfs", "LOCAL")
            .with_role(Role::Name, 1)
            .with_optional_role(Role::Data, 0);
        assert!(optional.validate().is_ok());
    }

    #[test]
    fn test_duplicate_client_rejected() {
        let topology = topology().with_client("alice");
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_invalid_service_name() {
        let topology = ServiceTopology::new("HDFS.prod", "LOCAL").with_role(Role::Name, 1);
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("Journal".parse::<Role>().unwrap(), Role::Journal);
        assert!("zkfc".parse::<Role>().is_err());
    }
}
