//! HDFS Guard 身份控制核心
//!
//! 该模块实现 HDFS 服务身份与安全通道的生命周期管理：为多角色服务的
//! 每个任务供应 Kerberos keytab、签发绑定到任务 DNS 名称的 TLS 证书、
//! 在任务启动时绑定并验证凭据，以及维护主体到本地用户的映射规则。

pub mod authz;
pub mod ca;
pub mod controller;
pub mod gate;
pub mod identity;
pub mod kdc;
pub mod mapping;
pub mod metrics;
pub mod secrets;
pub mod tls;
pub mod utils;

pub use authz::{Access, AuthorizationHook, FileStatus};
pub use controller::IdentityController;
pub use gate::{HttpsGate, RejectAllAcceptor, SpnegoAcceptor};
pub use identity::{BinderConfig, BindingState, IssuerConfig, ProvisionerConfig};
pub use mapping::{AuthMappingResolver, MappingRuleSpec, Resolution};
pub use metrics::GuardMetrics;
