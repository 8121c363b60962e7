//! 基于 kadmin 的 KDC 客户端
//!
//! 通过 `tokio::process` 调用 MIT Kerberos 的 `kadmin` 与 `kinit`。
//! 导出的 keytab 只写入私有临时文件，所有退出路径上都会删除。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hdfs_guard_common::{Error, Result};

use super::{KdcClient, KdcConfig, PrincipalCreation};
use crate::utils::{with_timeout, write_private_file};

/// 主体上记录归属的字符串属性名
const OWNER_ATTRIBUTE: &str = "hdfs-guard.owner";

/// kadmin 查询执行器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KadminRunner: Send + Sync {
    /// 执行一条查询，返回标准输出
    async fn query(&self, query: &str) -> Result<String>;
}

/// 以子进程方式调用 `kadmin`
#[derive(Debug, Clone)]
pub struct KadminCommand {
    config: KdcConfig,
}

impl KadminCommand {
    pub fn new(config: KdcConfig) -> Self {
        Self { config }
    }
}

fn command(config: &KdcConfig, program: &str) -> Command {
    let mut command = Command::new(program);
    if let Some(krb5_config) = &config.krb5_config {
        command.env("KRB5_CONFIG", krb5_config);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

fn timeout(config: &KdcConfig) -> Duration {
    Duration::from_secs(config.request_timeout_secs)
}

#[async_trait]
impl KadminRunner for KadminCommand {
    async fn query(&self, query: &str) -> Result<String> {
        let mut command = command(&self.config, &self.config.kadmin_path);
        command
            .arg("-r")
            .arg(&self.config.realm)
            .arg("-s")
            .arg(self.config.address())
            .arg("-p")
            .arg(&self.config.admin_principal)
            .arg("-k")
            .arg("-t")
            .arg(&self.config.admin_keytab)
            .arg("-q")
            .arg(query);

        debug!("执行 kadmin 查询: {}", query);
        let output = with_timeout(timeout(&self.config), "kadmin", async {
            command.output().await.map_err(|e| {
                Error::KdcUnreachable(format!("无法启动 {}: {}", self.config.kadmin_path, e))
            })
        })
        .await?;

        // kadmin 的查询失败通常仍以 0 退出，只能依据标准错误判断
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if let Some(err) = classify_stderr(&stderr, &self.config.address()) {
            return Err(err);
        }
        if !output.status.success() {
            return Err(Error::Kdc(first_line(&stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// 基于 kadmin 的 KDC 客户端
#[derive(Clone)]
pub struct KadminKdc {
    config: KdcConfig,
    runner: Arc<dyn KadminRunner>,
    scratch_dir: PathBuf,
}

impl KadminKdc {
    /// 创建 kadmin 客户端
    pub fn new(config: KdcConfig) -> Self {
        let runner = Arc::new(KadminCommand::new(config.clone()));
        Self::with_runner(config, runner)
    }

    /// 使用指定的查询执行器
    pub fn with_runner(config: KdcConfig, runner: Arc<dyn KadminRunner>) -> Self {
        let scratch_dir = config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self {
            config,
            runner,
            scratch_dir,
        }
    }

    async fn kadmin(&self, query: &str) -> Result<String> {
        self.runner.query(query).await
    }

    async fn owner_of(&self, principal: &str) -> Result<Option<String>> {
        let stdout = self.kadmin(&format!("get_strings {}", principal)).await?;
        Ok(parse_owner(&stdout))
    }
}

#[async_trait]
impl KdcClient for KadminKdc {
    async fn create_principal(&self, principal: &str, owner: &str) -> Result<PrincipalCreation> {
        match self.kadmin(&format!("addprinc -randkey {}", principal)).await {
            Ok(_) => {
                let tagged = self
                    .kadmin(&format!("set_string {} {} {}", principal, OWNER_ATTRIBUTE, owner))
                    .await;
                if let Err(e) = tagged {
                    // 无归属的主体重试时会被判定为冲突
                    warn!("设置主体 {} 的归属失败，回滚创建: {}", principal, e);
                    if let Err(rollback) = self.delete_principal(principal).await {
                        error!("回滚主体 {} 失败: {}", principal, rollback);
                    }
                    return Err(e);
                }
                info!("创建主体: {}", principal);
                Ok(PrincipalCreation::Created)
            }
            Err(Error::Kdc(message)) if message.contains("already exists") => {
                let owner = self.owner_of(principal).await?;
                debug!("主体已存在: {} (归属 {:?})", principal, owner);
                Ok(PrincipalCreation::Exists { owner })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_keytab(&self, principal: &str) -> Result<Vec<u8>> {
        let scratch = ScratchFile::new(&self.scratch_dir, "keytab");
        self.kadmin(&format!(
            "ktadd -k {} {}",
            scratch.path().display(),
            principal
        ))
        .await?;

        let bytes = tokio::fs::read(scratch.path()).await?;
        if bytes.is_empty() {
            return Err(Error::Kdc(format!("{} 的 keytab 为空", principal)));
        }
        Ok(bytes)
    }

    async fn authenticate(&self, principal: &str, keytab: &[u8]) -> Result<()> {
        let keytab_file = ScratchFile::new(&self.scratch_dir, "keytab");
        let cache_file = ScratchFile::new(&self.scratch_dir, "ccache");
        write_private_file(keytab_file.path(), keytab).await?;

        let mut command = command(&self.config, &self.config.kinit_path);
        command
            .arg("-k")
            .arg("-t")
            .arg(keytab_file.path())
            .arg("-c")
            .arg(format!("FILE:{}", cache_file.path().display()))
            .arg(principal);

        let output = with_timeout(timeout(&self.config), "kinit", async {
            command.output().await.map_err(|e| {
                Error::KdcUnreachable(format!("无法启动 {}: {}", self.config.kinit_path, e))
            })
        })
        .await?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match classify_stderr(&stderr, &self.config.address()) {
            Some(Error::Kdc(message)) => Err(Error::Authentication(message)),
            Some(err) => Err(err),
            None => Err(Error::Authentication(first_line(&stderr))),
        }
    }

    async fn delete_principal(&self, principal: &str) -> Result<()> {
        match self.kadmin(&format!("delprinc -force {}", principal)).await {
            Ok(_) => {
                info!("删除主体: {}", principal);
                Ok(())
            }
            Err(Error::Kdc(message)) if message.contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// 根据标准错误判断失败类型
fn classify_stderr(stderr: &str, address: &str) -> Option<Error> {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return None;
    }
    let unreachable = [
        "Cannot contact any KDC",
        "Cannot resolve network address",
        "Connection refused",
        "GSS-API (or Kerberos) error while initializing kadmin interface",
    ];
    if unreachable.iter().any(|pattern| stderr.contains(pattern)) {
        return Some(Error::KdcUnreachable(address.to_string()));
    }
    // kadmin 在正常执行时也会输出 "Authenticating as principal" 提示
    let meaningful: Vec<&str> = stderr
        .lines()
        .filter(|line| !line.starts_with("Authenticating as principal"))
        .filter(|line| !line.starts_with("WARNING: no policy specified"))
        .collect();
    if meaningful.is_empty() {
        return None;
    }
    Some(Error::Kdc(meaningful.join("; ")))
}

/// 从 get_strings 输出中解析归属
fn parse_owner(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        (key.trim() == OWNER_ATTRIBUTE).then(|| value.trim().to_string())
    })
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().trim().to_string()
}

/// 私有临时文件，离开作用域时删除
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(dir: &Path, extension: &str) -> Self {
        Self {
            path: dir.join(format!("hdfs-guard-{}.{}", Uuid::new_v4(), extension)),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除临时文件 {} 失败: {}", self.path.display(), e),
        }
    }
}
