//! V2K 通用类型定义
//!
//! 此 crate 包含 CLI 与各核心 crate 之间共享的类型：
//! 日志级别映射和任务结果分类。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 日志详细程度
///
/// `-v`/`-q` 可重复计数（各最多 2 次），映射到 tracing 级别：
/// 默认 WARN，-v=INFO，-vv=DEBUG，-q=ERROR，-qq=完全静默。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verbosity {
    pub verbose: u8,
    pub quiet: u8,
}

impl Verbosity {
    pub fn new(verbose: u8, quiet: u8) -> Self {
        Self {
            verbose: verbose.min(2),
            quiet: quiet.min(2),
        }
    }

    /// 映射到 tracing 级别，`None` 表示完全静默
    pub fn level(&self) -> Option<tracing::Level> {
        if self.quiet >= 2 {
            return None;
        }
        Some(match (self.verbose, self.quiet) {
            (_, 1) => tracing::Level::ERROR,
            (0, _) => tracing::Level::WARN,
            (1, _) => tracing::Level::INFO,
            (_, _) => tracing::Level::DEBUG,
        })
    }

    /// 转发给外部工具的 `-v`/`-q` 参数列表
    ///
    /// 部分外部工具（virt-v2v 等）接受同样的重复计数参数。
    pub fn forward_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for _ in 0..self.verbose {
            args.push("-v".to_string());
        }
        for _ in 0..self.quiet {
            args.push("-q".to_string());
        }
        args
    }
}

/// 目标磁盘镜像格式
///
/// `None` 表示不做格式转换，域描述符直接引用主机侧可达的源文件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Qcow2,
    Raw,
    None,
}

impl ImageFormat {
    /// 目标文件扩展名，`None` 时无转换产物
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ImageFormat::Qcow2 => Some("qcow2"),
            ImageFormat::Raw => Some("raw"),
            ImageFormat::None => None,
        }
    }

    /// libvirt driver type 取值
    pub fn driver_type(&self) -> Option<&'static str> {
        match self {
            ImageFormat::Qcow2 => Some("qcow2"),
            ImageFormat::Raw => Some("raw"),
            ImageFormat::None => None,
        }
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qcow2" => Ok(ImageFormat::Qcow2),
            "raw" => Ok(ImageFormat::Raw),
            "none" => Ok(ImageFormat::None),
            other => Err(format!("未知镜像格式: {other:?}")),
        }
    }
}

/// 启动测试结果
///
/// 三态终结结果，不自动重试。进程退出码一一对应：
/// 0=Success，1=ScriptFailure，2=BootFailure。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootTestOutcome {
    /// 在超时前观测到就绪信号
    Success,
    /// 超时仍未观测到就绪信号（客户机行为问题）
    BootFailure,
    /// 定义/启动瞬态实例失败（环境/管理层问题）
    ScriptFailure,
}

impl BootTestOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootTestOutcome::Success => 0,
            BootTestOutcome::ScriptFailure => 1,
            BootTestOutcome::BootFailure => 2,
        }
    }
}

/// 转换任务的单行分类结果
///
/// 批量调用方按 VM 聚合通过/失败，只看这一行与退出码，
/// 完整诊断细节在任务日志工件中。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    ParseFailure,
    MapFailure,
    ConvFailure,
    AdjustFailure,
    BootFailure,
    ScriptFailure,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::Success => 0,
            _ => 1,
        }
    }
}

impl From<BootTestOutcome> for JobOutcome {
    fn from(outcome: BootTestOutcome) -> Self {
        match outcome {
            BootTestOutcome::Success => JobOutcome::Success,
            BootTestOutcome::BootFailure => JobOutcome::BootFailure,
            BootTestOutcome::ScriptFailure => JobOutcome::ScriptFailure,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "SUCCESS"),
            JobOutcome::ParseFailure => write!(f, "FAILURE(parse)"),
            JobOutcome::MapFailure => write!(f, "FAILURE(map)"),
            JobOutcome::ConvFailure => write!(f, "FAILURE(conv)"),
            JobOutcome::AdjustFailure => write!(f, "FAILURE(adjust)"),
            JobOutcome::BootFailure => write!(f, "FAILURE(boot)"),
            JobOutcome::ScriptFailure => write!(f, "FAILURE(script)"),
        }
    }
}
