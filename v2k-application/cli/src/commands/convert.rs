//! convert 子命令
//!
//! 完整的引擎入口：解析、映射、合成、可选的磁盘转换/客户机
//! 调整/启动验证。交互面上只输出一行分类结果，细节全在任务
//! 日志工件里。

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use v2k_adjust::AdjustMethod;
use v2k_boottest::ProbeKind;
use v2k_common::{ImageFormat, Verbosity};
use v2k_domain::DiskMode;
use v2k_img::ConvertEngine;
use v2k_job::{ConversionJob, JobConfig};
use v2k_mapper::{MappingRule, NetworkRule, NetworkTarget};

#[derive(Args)]
pub struct ConvertArgs {
    /// 源 VMX 定义文件
    #[arg(short = 'f', long = "filename", value_name = "VMX")]
    pub filename: PathBuf,

    /// 输出描述符路径，缺省时按映射规则从源路径推导
    #[arg(short = 'o', long = "output-xml", value_name = "XML")]
    pub output_xml: Option<PathBuf>,

    /// 数据存储映射规则 REF,MOUNTED[,TARGET]，按给出顺序匹配，可重复；
    /// 省略 TARGET 即直通规则（只换位置、不转换内容）
    #[arg(short = 'd', long = "datastore", value_name = "RULE", value_parser = parse_datastore)]
    pub datastore: Vec<MappingRule>,

    /// 网络映射规则 name:<源名称>=<目标> 或 type:<连接类型>=<目标>，
    /// 目标写作 net:<名称> 或 bridge:<名称>，可重复
    #[arg(short = 'n', long = "network", value_name = "RULE", value_parser = parse_network)]
    pub network: Vec<NetworkRule>,

    /// 未命中任何网络规则时的默认目标
    #[arg(long = "default-network", value_name = "TARGET", default_value = "net:default", value_parser = parse_network_target)]
    pub default_network: NetworkTarget,

    /// 触发磁盘格式转换
    #[arg(short = 't', long = "translate")]
    pub translate: bool,

    /// 只转换引导盘（快速迭代模式）
    #[arg(long = "os-disk-only")]
    pub os_disk_only: bool,

    /// 客户机调整经一次性 qcow2 覆盖层进行，源盘绝不被写
    #[arg(short = 'O', long = "overlay")]
    pub overlay: bool,

    /// 使用备选的 qemu 直连转换引擎（默认 virt-v2v 兼容引擎）
    #[arg(short = 'x', long = "experimental")]
    pub experimental: bool,

    /// 实验性拷贝路径：两端 qemu-nbd + nbdcopy
    #[arg(short = 'N', long = "nbd")]
    pub nbd: bool,

    /// 转换后调整客户机文件系统以便在 KVM 上引导
    #[arg(short = 'a', long = "adjust")]
    pub adjust: bool,

    /// 调整方法：v2v（整机就地）或 experimental（libguestfs 脚本）
    #[arg(long = "adjust-method", value_name = "METHOD", default_value = "v2v", value_parser = parse_adjust_method)]
    pub adjust_method: AdjustMethod,

    /// 保真模式：尽量保留源端控制器总线与编址（默认性能模式）
    #[arg(long = "fidelity")]
    pub fidelity: bool,

    /// 目标镜像格式：qcow2、raw 或 none（不转换）
    #[arg(long = "format", value_name = "FMT", default_value = "qcow2", value_parser = parse_format)]
    pub format: ImageFormat,

    /// qemu 侧缓存模式
    #[arg(long = "cache-mode", value_name = "MODE", default_value = "writeback")]
    pub cache_mode: String,

    /// 并行拷贝线程数
    #[arg(long = "parallel", value_name = "N")]
    pub parallel: Option<u32>,

    /// 把转换进程钉在指定 NUMA 节点
    #[arg(long = "numa-node", value_name = "NODE")]
    pub numa_node: Option<u32>,

    /// 用 trace-cmd 记录转换过程做剖析
    #[arg(long = "trace-cmd")]
    pub trace_cmd: bool,

    /// 转换完成后引导测试，可带超时秒数
    #[arg(short = 'T', long = "test-boot", value_name = "SECS", num_args = 0..=1, default_missing_value = "60")]
    pub test_boot: Option<u64>,

    /// 引导就绪探测方式：agent（代理握手）或 passive（被动等待）
    #[arg(long = "probe", value_name = "KIND", default_value = "agent", value_parser = parse_probe)]
    pub probe: ProbeKind,

    /// 启动验证挂到隔离网络上
    #[arg(short = 'i', long = "isolated")]
    pub isolated: bool,

    /// 启动验证后保留瞬态实例以便调试
    #[arg(short = 'k', long = "keep")]
    pub keep: bool,

    /// libvirt 连接 URI
    #[arg(short = 'c', long = "connect", value_name = "URI", default_value = "qemu:///system")]
    pub connect: String,
}

fn parse_datastore(s: &str) -> Result<MappingRule, String> {
    MappingRule::parse(s).map_err(|e| e.to_string())
}

fn parse_network(s: &str) -> Result<NetworkRule, String> {
    NetworkRule::parse(s).map_err(|e| e.to_string())
}

fn parse_network_target(s: &str) -> Result<NetworkTarget, String> {
    NetworkTarget::parse(s).map_err(|e| e.to_string())
}

fn parse_format(s: &str) -> Result<ImageFormat, String> {
    s.parse()
}

fn parse_probe(s: &str) -> Result<ProbeKind, String> {
    s.parse()
}

fn parse_adjust_method(s: &str) -> Result<AdjustMethod, String> {
    match s.to_lowercase().as_str() {
        "v2v" => Ok(AdjustMethod::V2vInPlace),
        "experimental" | "x" => Ok(AdjustMethod::Experimental),
        other => Err(format!("未知调整方法: {other:?}")),
    }
}

/// 按将要运行的阶段探测外部工具，缺工具早失败
async fn detect_tools(args: &ConvertArgs, verbosity: Verbosity) -> Result<()> {
    if args.translate && args.format != ImageFormat::None {
        if args.experimental {
            v2k_img::detect_qemu_img().await.context("qemu-img 不可用")?;
            if args.nbd {
                v2k_img::detect_nbdcopy().await.context("nbdcopy 不可用")?;
            }
        } else {
            v2k_img::detect_virt_v2v().await.context("virt-v2v 不可用")?;
        }
        if args.trace_cmd {
            v2k_img::detect_trace_cmd().await.context("trace-cmd 不可用")?;
        }
    }
    if args.adjust {
        v2k_adjust::detect_inspector()
            .await
            .context("virt-inspector 不可用")?;
        v2k_adjust::GuestAdjuster::new(v2k_runcmd::CmdRunner::new())
            .with_method(args.adjust_method)
            .with_verbosity(verbosity)
            .detect_tool_version()
            .await
            .context("调整工具不可用")?;
    }
    Ok(())
}

pub async fn handle(args: ConvertArgs, verbosity: Verbosity) -> Result<i32> {
    detect_tools(&args, verbosity).await?;

    let mut cfg = JobConfig::new(args.filename.clone());
    cfg.output_xml = args.output_xml.clone();
    cfg.datastores = args.datastore.clone();
    cfg.networks = args.network.clone();
    cfg.default_network = args.default_network.clone();
    cfg.mode = if args.fidelity {
        DiskMode::Fidelity
    } else {
        DiskMode::Performance
    };
    cfg.format = args.format;
    cfg.translate_disks = args.translate;
    cfg.os_disk_only = args.os_disk_only;
    cfg.overlay_adjust = args.overlay;
    cfg.engine = if args.experimental {
        ConvertEngine::Qemu
    } else {
        ConvertEngine::V2v
    };
    cfg.nbd_copy = args.nbd;
    cfg.adjust = args.adjust;
    cfg.adjust_method = args.adjust_method;
    cfg.cache_mode = args.cache_mode.clone();
    cfg.parallel = args.parallel;
    cfg.numa_node = args.numa_node;
    cfg.trace = args.trace_cmd;
    cfg.boot_test = args.test_boot.map(Duration::from_secs);
    cfg.probe = args.probe;
    cfg.isolated = args.isolated;
    cfg.keep = args.keep;
    cfg.connect_uri = args.connect.clone();
    cfg.verbosity = verbosity;

    let report = ConversionJob::new(cfg).run().await;

    // 批量调用方只看这一行和退出码
    println!("{}: {}", args.filename.display(), report.outcome);
    Ok(report.outcome.exit_code())
}
