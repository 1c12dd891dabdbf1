//! 任务配置
//!
//! 每次调用构造一份，规则列表不可变地传给映射器，
//! 并发任务之间没有共享可变状态。

use std::path::PathBuf;
use std::time::Duration;

use v2k_adjust::AdjustMethod;
use v2k_boottest::ProbeKind;
use v2k_common::{ImageFormat, Verbosity};
use v2k_domain::DiskMode;
use v2k_img::ConvertEngine;
use v2k_mapper::{MappingRule, NetworkRule, NetworkTarget};

/// 一个转换任务的全部配置
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// 源描述符路径
    pub vmx_path: PathBuf,
    /// 输出描述符路径；缺省时按映射规则从源路径推导
    pub output_xml: Option<PathBuf>,

    /// 有序数据存储映射规则
    pub datastores: Vec<MappingRule>,
    /// 网络映射规则
    pub networks: Vec<NetworkRule>,
    pub default_network: NetworkTarget,

    /// 磁盘翻译模式（保真/性能）
    pub mode: DiskMode,
    /// 目标镜像格式
    pub format: ImageFormat,

    /// 触发磁盘转换
    pub translate_disks: bool,
    /// 只转换引导盘（快速迭代模式）
    pub os_disk_only: bool,
    /// 调整经一次性覆盖层进行，源盘不被触碰
    pub overlay_adjust: bool,
    /// 转换引擎
    pub engine: ConvertEngine,
    /// 实验性 nbdcopy 拷贝路径
    pub nbd_copy: bool,

    /// 触发客户机调整
    pub adjust: bool,
    pub adjust_method: AdjustMethod,

    /// 转换调优
    pub cache_mode: String,
    pub parallel: Option<u32>,
    pub numa_node: Option<u32>,
    pub trace: bool,

    /// 转换后进行启动验证，值为超时
    pub boot_test: Option<Duration>,
    pub probe: ProbeKind,
    pub isolated: bool,
    pub keep: bool,
    pub connect_uri: String,

    pub verbosity: Verbosity,
}

impl JobConfig {
    pub fn new(vmx_path: PathBuf) -> Self {
        Self {
            vmx_path,
            output_xml: None,
            datastores: Vec::new(),
            networks: Vec::new(),
            default_network: NetworkTarget::Network("default".to_string()),
            mode: DiskMode::default(),
            format: ImageFormat::default(),
            translate_disks: false,
            os_disk_only: false,
            overlay_adjust: false,
            engine: ConvertEngine::default(),
            nbd_copy: false,
            adjust: false,
            adjust_method: AdjustMethod::default(),
            cache_mode: "writeback".to_string(),
            parallel: None,
            numa_node: None,
            trace: false,
            boot_test: None,
            probe: ProbeKind::Agent,
            isolated: false,
            keep: false,
            connect_uri: "qemu:///system".to_string(),
            verbosity: Verbosity::default(),
        }
    }
}
