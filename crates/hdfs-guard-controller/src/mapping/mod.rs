//! 主体映射模块
//!
//! 维护 Kerberos 主体到本地用户的映射规则，供存储引擎的权限检查使用。

mod resolver;
mod rule;

pub use resolver::{apply_rules, validate_completeness, AuthMappingResolver, Resolution};
pub use rule::{KerberosName, MappingRule, MappingRuleSpec};
