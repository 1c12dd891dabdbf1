//! testboot 子命令
//!
//! 独立的启动验证入口：定义瞬态实例、限时引导、保证回收。
//! 进程退出码与结果一一对应：0=Success，1=ScriptFailure，
//! 2=BootFailure，批量调用方据此聚合。

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use v2k_boottest::{BootValidator, ProbeKind};
use v2k_common::{JobOutcome, Verbosity};

#[derive(Args)]
pub struct TestbootArgs {
    /// 待测试的 libvirt 域描述符
    #[arg(short = 'f', long = "filename", value_name = "XML")]
    pub filename: PathBuf,

    /// 就绪等待超时（秒）
    #[arg(short = 't', long = "timeout", value_name = "SECS", default_value = "60")]
    pub timeout: u64,

    /// 引导就绪探测方式：agent（代理握手）或 passive（被动等待）
    #[arg(long = "probe", value_name = "KIND", default_value = "agent", value_parser = parse_probe)]
    pub probe: ProbeKind,

    /// 挂到隔离网络上测试，避免对生产网段产生副作用
    #[arg(short = 'i', long = "isolated")]
    pub isolated: bool,

    /// 测试后保留瞬态实例以便调试
    #[arg(short = 'k', long = "keep")]
    pub keep: bool,

    /// libvirt 连接 URI
    #[arg(short = 'c', long = "connect", value_name = "URI", default_value = "qemu:///system")]
    pub connect: String,
}

fn parse_probe(s: &str) -> Result<ProbeKind, String> {
    s.parse()
}

pub async fn handle(args: TestbootArgs, _verbosity: Verbosity) -> Result<i32> {
    let validator = BootValidator::new()
        .with_uri(args.connect.clone())
        .with_timeout(Duration::from_secs(args.timeout))
        .with_probe(args.probe.build())
        .with_isolated(args.isolated)
        .with_keep(args.keep);

    let outcome = validator.validate(&args.filename).await;

    println!(
        "{}: {}",
        args.filename.display(),
        JobOutcome::from(outcome)
    );
    Ok(outcome.exit_code())
}
