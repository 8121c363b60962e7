//! 主体映射解析器
//!
//! 规则列表按顺序匹配，第一条命中的规则决定用户名。规则列表以
//! `Arc<Vec<_>>` 整体替换，读取方总是看到完整的新列表或完整的旧列表。

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use hdfs_guard_common::{Error, Principal, Result};

use super::rule::{KerberosName, MappingRule, MappingRuleSpec};
use crate::metrics::GuardMetrics;

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 映射到本地用户
    Mapped { username: String, superuser: bool },
    /// 没有规则匹配，调用方必须拒绝操作
    Unmapped,
}

impl Resolution {
    /// 映射到的用户名
    pub fn username(&self) -> Option<&str> {
        match self {
            Resolution::Mapped { username, .. } => Some(username),
            Resolution::Unmapped => None,
        }
    }

    /// 是否为超级用户
    pub fn is_superuser(&self) -> bool {
        matches!(self, Resolution::Mapped { superuser: true, .. })
    }
}

/// 依次应用规则，返回第一条命中的结果
pub fn apply_rules(rules: &[MappingRule], principal: &str, default_realm: &str) -> Resolution {
    let Ok(name) = KerberosName::parse(principal) else {
        return Resolution::Unmapped;
    };
    rules
        .iter()
        .find_map(|rule| {
            rule.apply(&name, default_realm)
                .map(|username| Resolution::Mapped {
                    username,
                    superuser: rule.is_superuser(),
                })
        })
        .unwrap_or(Resolution::Unmapped)
}

/// 返回没有任何规则匹配的主体
pub fn validate_completeness<'a, I>(
    principals: I,
    rules: &[MappingRule],
    default_realm: &str,
) -> Vec<Principal>
where
    I: IntoIterator<Item = &'a Principal>,
{
    principals
        .into_iter()
        .filter(|principal| {
            apply_rules(rules, &principal.name(), default_realm) == Resolution::Unmapped
        })
        .cloned()
        .collect()
}

/// 主体映射解析器
pub struct AuthMappingResolver {
    /// 默认 realm
    realm: String,
    /// 当前规则列表
    rules: RwLock<Arc<Vec<MappingRule>>>,
    /// 指标
    metrics: Arc<GuardMetrics>,
}

impl AuthMappingResolver {
    /// 以编译好的规则创建解析器
    pub fn new(realm: &str, rules: Vec<MappingRule>, metrics: Arc<GuardMetrics>) -> Self {
        Self {
            realm: realm.to_string(),
            rules: RwLock::new(Arc::new(rules)),
            metrics,
        }
    }

    /// 从配置创建解析器
    pub fn from_specs(
        realm: &str,
        specs: &[MappingRuleSpec],
        metrics: Arc<GuardMetrics>,
    ) -> Result<Self> {
        Ok(Self::new(realm, MappingRule::parse_all(specs)?, metrics))
    }

    /// 默认 realm
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// 当前规则列表的快照
    pub fn rules(&self) -> Arc<Vec<MappingRule>> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 解析主体
    pub fn resolve(&self, principal: &str) -> Resolution {
        let rules = self.rules();
        let resolution = apply_rules(&rules, principal, &self.realm);
        self.metrics
            .record_resolution(resolution != Resolution::Unmapped);
        match &resolution {
            Resolution::Mapped { username, .. } => debug!("{} -> {}", principal, username),
            Resolution::Unmapped => warn!("主体 {} 没有匹配的映射规则", principal),
        }
        resolution
    }

    /// 解析主体
    pub fn resolve_principal(&self, principal: &Principal) -> Resolution {
        self.resolve(&principal.name())
    }

    /// 解析主体，未映射时返回 `Error::Unmapped`
    pub fn resolve_user(&self, principal: &str) -> Result<(String, bool)> {
        match self.resolve(principal) {
            Resolution::Mapped { username, superuser } => Ok((username, superuser)),
            Resolution::Unmapped => Err(Error::Unmapped(principal.to_string())),
        }
    }

    /// 当前规则下没有映射的主体
    pub fn unmapped<'a, I>(&self, principals: I) -> Vec<Principal>
    where
        I: IntoIterator<Item = &'a Principal>,
    {
        validate_completeness(principals, &self.rules(), &self.realm)
    }

    /// 原子替换规则列表
    ///
    /// 新规则会使任一已供应主体失去映射时拒绝替换，旧规则保持生效。
    pub fn replace_rules(
        &self,
        specs: &[MappingRuleSpec],
        provisioned: &BTreeSet<Principal>,
    ) -> Result<()> {
        let rules = MappingRule::parse_all(specs)?;
        let missing = validate_completeness(provisioned, &rules, &self.realm);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(Principal::name).collect();
            return Err(Error::InvalidRule(format!(
                "以下主体将失去映射: {}",
                names.join(", ")
            )));
        }

        let count = rules.len();
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rules);
        info!("映射规则已更新，共 {} 条", count);
        Ok(())
    }

    /// 渲染为 HDFS 的 `hadoop.security.auth_to_local` 配置值
    pub fn auth_to_local(&self) -> String {
        self.rules()
            .iter()
            .map(|rule| rule.source().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdfs_guard_common::{Role, ServiceTopology};
    use crate::identity::PrincipalRegistry;

    fn specs() -> Vec<MappingRuleSpec> {
        vec![
            MappingRuleSpec::superuser("RULE:[2:$1@$0](hdfs@LOCAL)s/.*/hdfs/"),
            MappingRuleSpec::superuser("RULE:[2:$1@$0](HTTP@LOCAL)s/.*/hdfs/"),
            MappingRuleSpec::superuser("RULE:[1:$1@$0](hdfs@LOCAL)s/@.*//"),
            MappingRuleSpec::new("RULE:[1:$1@$0](.*@LOCAL)s/@.*//"),
        ]
    }

    fn resolver(specs: &[MappingRuleSpec]) -> AuthMappingResolver {
        AuthMappingResolver::from_specs("LOCAL", specs, Arc::new(GuardMetrics::new().unwrap()))
            .unwrap()
    }

    fn topology() -> ServiceTopology {
        ServiceTopology::new("hdfs", "LOCAL")
            .with_role(Role::Journal, 3)
            .with_role(Role::Name, 2)
            .with_role(Role::Data, 3)
            .with_client("hdfs")
            .with_client("alice")
            .with_client("bob")
            .with_primaries(&["hdfs", "HTTP"])
    }

    #[test]
    fn test_first_match_wins() {
        let resolver = resolver(&specs());
        assert_eq!(
            resolver.resolve("hdfs@LOCAL"),
            Resolution::Mapped {
                username: "hdfs".to_string(),
                superuser: true
            }
        );
        assert_eq!(
            resolver.resolve("alice@LOCAL"),
            Resolution::Mapped {
                username: "alice".to_string(),
                superuser: false
            }
        );
        assert!(resolver.resolve("HTTP/name-0-node.hdfs@LOCAL").is_superuser());
    }

    #[test]
    fn test_unmapped_fails_closed() {
        let resolver = resolver(&specs());
        assert_eq!(resolver.resolve("mallory@EVIL"), Resolution::Unmapped);
        assert_eq!(resolver.resolve("yarn/host@LOCAL"), Resolution::Unmapped);
        assert_eq!(resolver.resolve("not a principal@"), Resolution::Unmapped);
        assert!(matches!(
            resolver.resolve_user("mallory@EVIL"),
            Err(Error::Unmapped(_))
        ));
    }

    #[test]
    fn test_completeness_of_topology() {
        let principals = PrincipalRegistry::derive(&topology()).unwrap();
        let resolver = resolver(&specs());
        assert!(resolver.unmapped(&principals).is_empty());

        let partial = resolver(&specs()[2..]);
        let missing = partial.unmapped(&principals);
        // 3 + 2 + 3 个节点，每个节点两个主体
        assert_eq!(missing.len(), 16);
        assert!(missing.iter().all(|p| p.task_id().is_some()));
    }

    #[test]
    fn test_replace_rejects_unmapping_provisioned() {
        let principals = PrincipalRegistry::derive(&topology()).unwrap();
        let resolver = resolver(&specs());

        let err = resolver
            .replace_rules(&specs()[2..], &principals)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)));
        // 旧规则保持生效
        assert_eq!(resolver.rules().len(), 4);

        let mut extended = specs();
        extended.insert(0, MappingRuleSpec::new("RULE:[1:$1@$0](carol@LOCAL)s/.*/caroline/"));
        resolver.replace_rules(&extended, &principals).unwrap();
        assert_eq!(
            resolver.resolve("carol@LOCAL").username(),
            Some("caroline")
        );
    }

    #[test]
    fn test_replace_rejects_invalid_rule() {
        let resolver = resolver(&specs());
        let err = resolver
            .replace_rules(&[MappingRuleSpec::new("RULE:broken")], &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)));
        assert_eq!(resolver.rules().len(), 4);
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let resolver = resolver(&specs());
        let snapshot = resolver.rules();
        resolver
            .replace_rules(&[MappingRuleSpec::new("DEFAULT")], &BTreeSet::new())
            .unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(resolver.rules().len(), 1);
    }

    #[test]
    fn test_auth_to_local_rendering() {
        let resolver = resolver(&[
            MappingRuleSpec::new("RULE:[1:$1@$0](.*@LOCAL)s/@.*//"),
            MappingRuleSpec::new("DEFAULT"),
        ]);
        assert_eq!(
            resolver.auth_to_local(),
            "RULE:[1:$1@$0](.*@LOCAL)s/@.*//\nDEFAULT"
        );
    }

    #[test]
    fn test_resolution_metrics() {
        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let resolver =
            AuthMappingResolver::from_specs("LOCAL", &specs(), metrics.clone()).unwrap();
        resolver.resolve("alice@LOCAL");
        resolver.resolve("mallory@EVIL");
        let text = metrics.encode().unwrap();
        assert!(text.contains("hdfs_guard_mapping_resolutions_total{result=\"mapped\"} 1"));
        assert!(text.contains("hdfs_guard_mapping_resolutions_total{result=\"unmapped\"} 1"));
    }
}
