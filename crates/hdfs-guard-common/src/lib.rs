//! HDFS Guard Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 HDFS Guard 项目中所有组件共享的数据结构和错误处理。
//! 包括服务拓扑、Kerberos 主体、任务身份、keytab 与证书等数据模型，
//! 以及统一的错误分类机制。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::{Error, ErrorClass, Result};
pub use models::credential::*;
pub use models::principal::*;
pub use models::task::*;
pub use models::topology::*;
