//! 主体注册表
//!
//! 根据服务拓扑推导所需的全部 Kerberos 主体：每个（角色, 实例）对
//! 与每个 primary 组合出一个服务主体，再加上固定的客户端主体。
//! 推导是纯函数，相同拓扑总是得到相同集合。

use std::collections::BTreeSet;

use hdfs_guard_common::{Principal, Result, ServiceTopology, TaskIdentity};

/// 两个拓扑之间的主体差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalDiff {
    /// 新增的主体
    pub added: BTreeSet<Principal>,
    /// 移除的主体
    pub removed: BTreeSet<Principal>,
}

impl PrincipalDiff {
    /// 是否没有变化
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// 主体注册表
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalRegistry;

impl PrincipalRegistry {
    /// 推导拓扑所需的全部主体
    pub fn derive(topology: &ServiceTopology) -> Result<BTreeSet<Principal>> {
        topology.validate()?;

        let mut principals = BTreeSet::new();
        for task in topology.tasks() {
            principals.extend(Self::principals_for_task(topology, &task));
        }
        for client in &topology.clients {
            principals.insert(Principal::client(client, &topology.realm));
        }
        Ok(principals)
    }

    /// 某个任务的服务主体
    pub fn principals_for_task(topology: &ServiceTopology, task: &TaskIdentity) -> Vec<Principal> {
        topology
            .primaries
            .iter()
            .map(|primary| Principal::service(primary, task, &topology.realm))
            .collect()
    }

    /// 计算拓扑变更带来的主体差异
    pub fn diff(old: &ServiceTopology, new: &ServiceTopology) -> Result<PrincipalDiff> {
        let before = Self::derive(old)?;
        let after = Self::derive(new)?;
        Ok(PrincipalDiff {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        })
    }
}
