//! HDFS Guard Operator 命令行入口

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hdfs_guard_controller::identity::PrincipalRegistry;
use hdfs_guard_controller::mapping::{apply_rules, MappingRule};
use hdfs_guard_operator::config::OperatorConfig;
use hdfs_guard_operator::HdfsGuardOperator;

/// HDFS 服务身份与安全通道生命周期管理
#[derive(Debug, Parser)]
#[command(name = "hdfs-guard-operator", version, about)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, default_value = "/etc/hdfs-guard/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 运行 Operator（默认）
    Run,
    /// 校验配置文件
    CheckConfig,
    /// 列出拓扑需要的主体及其映射结果
    Principals,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OperatorConfig::load(&cli.config)
        .with_context(|| format!("无法加载配置文件: {:?}", cli.config))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("日志级别无效")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::CheckConfig => {
            let specs = config.validate()?;
            println!(
                "配置有效: 服务 {}，{} 个任务，{} 条映射规则",
                config.service.name,
                config.service.tasks().len(),
                specs.len()
            );
            Ok(())
        }
        Command::Principals => {
            let specs = config.validate()?;
            let rules = MappingRule::parse_all(&specs)?;
            for principal in PrincipalRegistry::derive(&config.service)? {
                let name = principal.name();
                let resolution = apply_rules(&rules, &name, &config.service.realm);
                let user = resolution.username().unwrap_or("<unmapped>");
                let marker = if resolution.is_superuser() { " (superuser)" } else { "" };
                println!("{} -> {}{}", name, user, marker);
            }
            Ok(())
        }
    }
}

async fn run(config: OperatorConfig) -> Result<()> {
    info!("启动 HDFS Guard Operator，服务 {}", config.service.name);
    let operator = HdfsGuardOperator::new(config).await?;
    operator.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    info!("收到退出信号，正在停止");

    operator.stop().await
}
