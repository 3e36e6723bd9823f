/// 集群配置工具
///
/// 读取集群定义，按托管环境创建虚拟机并完成节点的基础配置。
///
/// 用法：`provisioner [集群定义.json] [--force] [--config provisioner.toml]`
///
/// 退出码：0 成功；1 有节点配置失败；2 校验失败、资源冲突或其他全局错误。

use anyhow::{bail, Context};
use common::ClusterDefinition;
use hosting::HostingRegistry;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

mod context;
mod settings;

use context::EnvironmentContext;
use settings::Settings;

/// 命令行参数
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    definition: Option<PathBuf>,
    config: Option<PathBuf>,
    force: bool,
}

fn parse_args<I>(args: I) -> anyhow::Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--force" => parsed.force = true,
            "--config" => {
                let path = args.next().context("--config 需要一个文件路径")?;
                parsed.config = Some(PathBuf::from(path));
            }
            other if other.starts_with("--") => bail!("未知参数: {}", other),
            other => {
                if parsed.definition.is_some() {
                    bail!("只能指定一个集群定义文件");
                }
                parsed.definition = Some(PathBuf::from(other));
            }
        }
    }

    Ok(parsed)
}

fn init_logging(format: &str) {
    // 日志级别通过 RUST_LOG 设置，例如 RUST_LOG=hosting=debug
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_line_number(true)
        .with_env_filter(filter);

    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    dotenvy::dotenv().ok();

    let settings = Settings::load(args.config.as_deref()).context("加载配置失败")?;
    init_logging(&settings.log_format);

    info!("🚀 启动集群配置工具...");

    let mut context = EnvironmentContext::from_settings(&settings)?;
    if let Some(path) = args.definition {
        context.definition_path = path;
    }
    context.force |= args.force;
    info!("✅ 配置加载成功");

    let definition = ClusterDefinition::from_file(&context.definition_path)?;
    definition.validate()?;
    info!(
        "📋 集群 {}: {} 个节点 ({:?})",
        definition.name,
        definition.nodes.len(),
        definition.hosting.environment
    );

    let registry = HostingRegistry::default();
    let cluster = context.cluster(definition.clone());
    let manager = registry.create(cluster, &context.hosting)?;
    manager.validate(&definition)?;

    if manager.is_provision_nop() {
        info!("⏭️ 托管环境无需创建资源");
    }
    if manager.requires_admin_privileges() {
        info!("🔐 该托管环境需要管理员权限");
    }
    if context.force {
        warn!("⚠️ 已启用 --force，同名虚拟机将被删除");
    }

    info!("🔧 并发数: {}", manager.max_parallel());
    let succeeded = manager.provision(context.force).await?;

    if succeeded {
        for node in &definition.nodes {
            let (address, port) = manager.ssh_endpoint(&node.name)?;
            info!("✅ {} ({:?}) ssh {}:{}", node.name, node.role, address, port);
        }
    }

    Ok(succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("one or more configuration steps failed");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("❌ {:#}", e);
            eprintln!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
