//! V2K CLI 应用

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use v2k_common::Verbosity;

mod commands;

#[derive(Parser)]
#[command(name = "v2k")]
#[command(about = "V2K - VMware 虚拟机定义到 KVM/libvirt 的迁移工具", long_about = None)]
#[command(version)]
struct Cli {
    /// 提高输出详细程度，可重复最多 2 次
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// 降低输出详细程度，可重复最多 2 次
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 转换 VMX 虚拟机定义为 libvirt 域描述符
    Convert(commands::convert::ConvertArgs),

    /// 引导测试一个 libvirt 域描述符（退出码 0=成功 1=环境失败 2=引导失败）
    Testboot(commands::testboot::TestbootArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose > 0 && cli.quiet > 0 {
        bail!("--verbose 与 --quiet 不能同时指定");
    }
    let verbosity = Verbosity::new(cli.verbose, cli.quiet);

    // 初始化日志；-qq 完全静默
    if let Some(level) = verbosity.level() {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .init();
    }

    info!("V2K 启动");

    let code = match cli.command {
        Commands::Convert(args) => commands::convert::handle(args, verbosity).await?,
        Commands::Testboot(args) => commands::testboot::handle(args, verbosity).await?,
    };
    std::process::exit(code);
}
