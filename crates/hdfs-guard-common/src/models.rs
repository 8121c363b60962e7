//! 数据模型模块
//!
//! 该模块定义了 HDFS Guard 项目中使用的核心数据模型，包括服务拓扑、
//! Kerberos 主体、任务身份和凭据材料，并提供序列化/反序列化功能。

pub mod topology;
pub mod principal;
pub mod task;
pub mod credential;
