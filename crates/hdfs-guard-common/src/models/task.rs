//! 任务身份模型
//!
//! 调度器为每个任务实例分配稳定的 DNS 名称 `{task-id}.{service-name}`，
//! 证书签发与身份绑定都显式接收 [`TaskIdentity`]，不依赖任何全局查找。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::models::topology::Role;

/// 任务 ID 后缀
const TASK_SUFFIX: &str = "node";

/// 任务身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdentity {
    /// 任务 ID，如 name-0-node
    pub task_id: String,
    /// 服务名称
    pub service_name: String,
    /// 角色
    pub role: Role,
    /// 实例序号
    pub index: u32,
}

impl TaskIdentity {
    /// 创建任务身份
    pub fn new(service_name: &str, role: Role, index: u32) -> Self {
        Self {
            task_id: format!("{}-{}-{}", role.as_str(), index, TASK_SUFFIX),
            service_name: service_name.to_string(),
            role,
            index,
        }
    }

    /// 从任务 ID 解析，如 `data-2-node`
    pub fn parse(task_id: &str, service_name: &str) -> Result<Self> {
        let invalid = || Error::InvalidTopology(format!("无效的任务 ID: {}", task_id));

        let mut parts = task_id.splitn(3, '-');
        let role: Role = parts.next().ok_or_else(invalid)?.parse()?;
        let index: u32 = parts
            .next()
            .and_then(|i| i.parse().ok())
            .ok_or_else(invalid)?;
        if parts.next() != Some(TASK_SUFFIX) || !role.is_node() {
            return Err(invalid());
        }

        Ok(Self::new(service_name, role, index))
    }

    /// 稳定的 DNS 名称，证书 CN 必须与之完全一致
    pub fn dns_name(&self) -> String {
        format!("{}.{}", self.task_id, self.service_name)
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dns_name())
    }
}

/// 调度器提供的任务生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// 任务启动
    Start(TaskIdentity),
    /// 任务停止，凭据保留以便快速重启
    Stop(TaskIdentity),
    /// 任务迁移到其他主机
    Relocate(TaskIdentity),
    /// 任务永久下线，凭据随之销毁
    Decommission(TaskIdentity),
}

impl TaskEvent {
    /// 事件对应的任务
    pub fn task(&self) -> &TaskIdentity {
        match self {
            TaskEvent::Start(task)
            | TaskEvent::Stop(task)
            | TaskEvent::Relocate(task)
            | TaskEvent::Decommission(task) => task,
        }
    }
}
