//! V2K 外部命令执行
//!
//! 转换流水线的所有外部工具调用（qemu-img、virt-v2v、nbdcopy 等）
//! 都经过这里：DEBUG 级别记录完整 argv，捕获 stdout/stderr，
//! 区分"无法启动"与"非零退出"两类失败，并可选地把工具输出
//! 追加到任务的捕获文件中。

use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RunCmdError {
    #[error("{program}: 无法启动命令: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program}: 命令执行失败: {detail}")]
    Failed { program: String, detail: String },

    #[error("{program}: 无法探测版本: {reason}")]
    VersionDetect { program: String, reason: String },

    #[error("捕获文件写入失败: {0}")]
    Capture(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunCmdError>;

/// 命令输出
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// 把多行错误输出压成单行，便于单行日志
fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 命令执行器
///
/// 可附加一个追加写入的捕获文件，记录每次调用的 argv 与输出，
/// 供事后诊断，程序自身从不回读。
#[derive(Debug, Clone, Default)]
pub struct CmdRunner {
    capture: Option<PathBuf>,
}

impl CmdRunner {
    pub fn new() -> Self {
        Self { capture: None }
    }

    /// 设置捕获文件路径
    pub fn with_capture(mut self, path: PathBuf) -> Self {
        self.capture = Some(path);
        self
    }

    async fn append_capture(&self, argv: &[String], output: &CmdOutput) -> Result<()> {
        let Some(path) = &self.capture else {
            return Ok(());
        };
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let mut buf = format!("$ {}\n", argv.join(" "));
        if !output.stdout.is_empty() {
            buf.push_str(&output.stdout);
            if !output.stdout.ends_with('\n') {
                buf.push('\n');
            }
        }
        if !output.stderr.is_empty() {
            buf.push_str(&output.stderr);
            if !output.stderr.ends_with('\n') {
                buf.push('\n');
            }
        }
        f.write_all(buf.as_bytes()).await?;
        Ok(())
    }

    /// 执行命令并等待退出，非零退出码视为失败
    pub async fn run(&self, argv: &[String]) -> Result<CmdOutput> {
        let program = argv[0].clone();
        debug!("{:?}", argv);

        let out = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| RunCmdError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = CmdOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        };
        self.append_capture(argv, &output).await?;

        if out.status.success() {
            Ok(output)
        } else {
            Err(RunCmdError::Failed {
                program,
                detail: squash_whitespace(&output.stderr),
            })
        }
    }

    /// 执行命令并等待退出，非零退出码仅告警并返回 `None`
    ///
    /// 无法启动命令仍然是硬错误。
    pub async fn run_lenient(&self, argv: &[String]) -> Result<Option<CmdOutput>> {
        match self.run(argv).await {
            Ok(out) => Ok(Some(out)),
            Err(err @ RunCmdError::Failed { .. }) => {
                warn!("{}", err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// 启动长驻后台进程（qemu-nbd 端点等），返回子进程句柄由调用方收尾
    pub fn spawn_background(&self, argv: &[String]) -> Result<Child> {
        debug!("{:?}", argv);
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunCmdError::Spawn {
                program: argv[0].clone(),
                source,
            })
    }
}

/// 探测外部工具版本
///
/// 运行 `argv` 并用 `pattern`（须含一个捕获组，形如 `(\d+\.\d+)`）
/// 在输出中按多行匹配版本号。工具缺失或无法解析时返回错误，
/// 容忍缺失的场合用 [`detect_version_lenient`]。
pub async fn detect_version(argv: &[String], pattern: &str) -> Result<f64> {
    let program = argv[0].clone();
    let runner = CmdRunner::new();
    let out = runner.run(argv).await?;

    let re = Regex::new(&format!("(?m){pattern}")).expect("版本匹配模式非法");
    let text = if out.stdout.is_empty() {
        &out.stderr
    } else {
        &out.stdout
    };
    let version = re
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| RunCmdError::VersionDetect {
            program: program.clone(),
            reason: squash_whitespace(text),
        })?;

    info!("{}: 检测到版本 {}", program, version);
    Ok(version)
}

/// [`detect_version`] 的宽容变体：失败时告警并返回 `None`
pub async fn detect_version_lenient(argv: &[String], pattern: &str) -> Option<f64> {
    match detect_version(argv, pattern).await {
        Ok(v) => Some(v),
        Err(err) => {
            warn!("{}", err);
            None
        }
    }
}

/// 便捷构造 argv
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
