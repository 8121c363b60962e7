//! 配置管理模块
//!
//! 该模块负责加载 Operator 的配置文件，支持 YAML/JSON 格式，
//! 并允许通过 `HDFS_GUARD_` 前缀的环境变量覆盖任意字段
//! （嵌套字段以 `__` 分隔，如 `HDFS_GUARD_KERBEROS__KDC__HOST`）。
//!
//! 映射规则可以放在独立的规则文件中，规则文件被修改后会热重载到
//! 映射解析器；会让已供应主体失去映射的新规则会被拒绝，旧规则继续生效。

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hdfs_guard_common::{Role, ServiceTopology};
use hdfs_guard_controller::identity::PrincipalRegistry;
use hdfs_guard_controller::kdc::KdcConfig;
use hdfs_guard_controller::mapping::{validate_completeness, MappingRule};
use hdfs_guard_controller::{
    BinderConfig, IdentityController, IssuerConfig, MappingRuleSpec, ProvisionerConfig,
};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "HDFS_GUARD";

/// Operator 配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// 服务拓扑
    pub service: ServiceTopology,
    /// Kerberos 配置
    pub kerberos: KerberosConfig,
    /// TLS 配置
    pub tls: TlsConfig,
    /// 身份绑定配置
    pub binder: BinderConfig,
    /// 映射规则配置
    pub mapping: MappingConfig,
    /// 密钥存储配置
    pub secrets: SecretsConfig,
    /// 健康检查服务器配置
    pub health: HealthConfig,
    /// 日志级别
    pub log_level: String,
}

/// KDC 后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdcBackend {
    /// 通过 kadmin/kinit 访问真实 KDC
    Kadmin,
    /// 进程内 KDC，仅用于开发环境
    Memory,
}

/// Kerberos 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KerberosConfig {
    /// KDC 后端
    pub backend: KdcBackend,
    /// KDC 连接参数
    pub kdc: KdcConfig,
    /// 凭据供应参数
    pub provisioner: ProvisionerConfig,
}

/// TLS 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// CA 配置
    pub ca: CaConfig,
    /// 证书签发参数
    pub issuer: IssuerConfig,
}

/// CA 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// CA 名称
    pub name: String,
    /// 根证书路径，未配置时在启动时生成
    pub cert_path: Option<PathBuf>,
    /// 根私钥路径
    pub key_path: Option<PathBuf>,
    /// 允许签发的 DNS 后缀，为空时使用服务名
    pub allowed_suffixes: Vec<String>,
}

/// 映射规则配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// 按顺序匹配的规则
    pub rules: Vec<MappingRuleSpec>,
    /// 规则文件，配置后优先于 `rules`
    pub rules_file: Option<PathBuf>,
}

/// 密钥存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackend {
    /// Kubernetes Secret
    Kubernetes,
    /// 进程内存储
    Memory,
}

/// 密钥存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// 后端
    pub backend: SecretsBackend,
    /// Secret 所在命名空间，为空时使用客户端默认命名空间
    pub namespace: Option<String>,
}

/// 健康检查服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        create_default_config()
    }
}

impl Default for KerberosConfig {
    fn default() -> Self {
        Self {
            backend: KdcBackend::Kadmin,
            kdc: KdcConfig::default(),
            provisioner: ProvisionerConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca: CaConfig::default(),
            issuer: IssuerConfig::default(),
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            name: "hdfs-guard".to_string(),
            cert_path: None,
            key_path: None,
            allowed_suffixes: Vec::new(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: SecretsBackend::Kubernetes,
            namespace: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl OperatorConfig {
    /// 从文件加载配置，环境变量覆盖文件中的值
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

        let format = match config_path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
        };

        let config = Config::builder()
            .add_source(File::with_name(config_file).format(format))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("构建配置失败")?;

        let operator_config = config
            .try_deserialize::<OperatorConfig>()
            .context("配置格式错误")?;

        Ok(operator_config)
    }

    /// 生效的映射规则
    pub fn mapping_rules(&self) -> Result<Vec<MappingRuleSpec>> {
        match &self.mapping.rules_file {
            Some(path) => load_rules_file(path),
            None => Ok(self.mapping.rules.clone()),
        }
    }

    /// CA 允许签发的 DNS 后缀
    pub fn allowed_suffixes(&self) -> Vec<String> {
        if self.tls.ca.allowed_suffixes.is_empty() {
            vec![self.service.name.clone()]
        } else {
            self.tls.ca.allowed_suffixes.clone()
        }
    }

    /// 校验配置，返回生效的映射规则
    ///
    /// 拓扑必须合法，规则必须可解析，且拓扑中的每个主体都必须有映射。
    pub fn validate(&self) -> Result<Vec<MappingRuleSpec>> {
        if self.service.realm != self.kerberos.kdc.realm
            && self.kerberos.backend == KdcBackend::Kadmin
        {
            return Err(anyhow!(
                "服务域 {} 与 KDC 域 {} 不一致",
                self.service.realm,
                self.kerberos.kdc.realm
            ));
        }

        self.tls.issuer.validate().context("证书签发配置无效")?;

        let principals = PrincipalRegistry::derive(&self.service).context("拓扑无效")?;
        let specs = self.mapping_rules()?;
        let rules = MappingRule::parse_all(&specs).context("映射规则无效")?;

        let unmapped = validate_completeness(&principals, &rules, &self.service.realm);
        if !unmapped.is_empty() {
            let names: Vec<String> = unmapped.iter().map(|p| p.name()).collect();
            return Err(anyhow!("以下主体没有映射规则: {}", names.join(", ")));
        }

        Ok(specs)
    }
}

/// 读取规则文件
///
/// `.yaml`/`.yml`/`.json` 文件是规则对象列表；其他文件按 Hadoop
/// `auth_to_local` 文本处理，每行一条规则，`#` 开头的行为注释。
pub fn load_rules_file(path: &Path) -> Result<Vec<MappingRuleSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取规则文件: {:?}", path))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") | Some("json") => serde_yaml::from_str(&content)
            .with_context(|| format!("规则文件格式错误: {:?}", path)),
        _ => Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(MappingRuleSpec::new)
            .collect()),
    }
}

/// 重新加载规则文件并原子替换到控制器
pub async fn reload_rules(path: &Path, controller: &IdentityController) -> Result<()> {
    let specs = load_rules_file(path)?;
    controller
        .replace_rules(&specs)
        .await
        .with_context(|| format!("拒绝规则文件 {:?} 中的新规则", path))?;
    info!("映射规则热重载成功，共 {} 条", specs.len());
    Ok(())
}

/// 规则文件监听器
///
/// 丢弃时停止监听。
pub struct RulesWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl RulesWatcher {
    /// 监听规则文件并在修改后热重载
    pub fn start(path: PathBuf, controller: Arc<IdentityController>) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let watched = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_)
                );
                if relevant && event.paths.iter().any(|p| p.ends_with(&watched)) {
                    let _ = tx.send(());
                }
            }
            Err(e) => error!("监听规则文件错误: {}", e),
        })
        .context("创建规则文件监听器失败")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("无法监听目录: {:?}", dir))?;
        info!("开始监听规则文件: {:?}", path);

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // 编辑器保存文件通常触发多个事件，合并为一次重载
                tokio::time::sleep(Duration::from_millis(200)).await;
                while rx.try_recv().is_ok() {}

                debug!("检测到规则文件变更: {:?}", path);
                if let Err(e) = reload_rules(&path, &controller).await {
                    warn!("规则热重载失败，保留旧规则: {:#}", e);
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for RulesWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 创建默认配置
pub fn create_default_config() -> OperatorConfig {
    OperatorConfig {
        service: ServiceTopology::new("hdfs", "LOCAL")
            .with_role(Role::Journal, 3)
            .with_role(Role::Name, 2)
            .with_role(Role::Data, 3)
            .with_client("hdfs")
            .with_primaries(&["hdfs", "HTTP"]),
        kerberos: KerberosConfig::default(),
        tls: TlsConfig::default(),
        binder: BinderConfig::default(),
        mapping: MappingConfig {
            rules: vec![
                MappingRuleSpec::superuser("RULE:[2:$1@$0](hdfs@LOCAL)s/.*/hdfs/"),
                MappingRuleSpec::superuser("RULE:[2:$1@$0](HTTP@LOCAL)s/.*/hdfs/"),
                MappingRuleSpec::superuser("RULE:[1:$1@$0](hdfs@LOCAL)s/@.*//"),
                MappingRuleSpec::new("RULE:[1:$1@$0](.*@LOCAL)s/@.*//"),
            ],
            rules_file: None,
        },
        secrets: SecretsConfig::default(),
        health: HealthConfig::default(),
        log_level: "info".to_string(),
    }
}
