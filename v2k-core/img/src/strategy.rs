//! 三个可互换的转换引擎

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::{numa_restrict_argv, qemu_img_info, ConvertOptions, ImgError, Result};
use v2k_runcmd::{argv, CmdRunner};

/// 磁盘转换能力：源镜像 → 目标路径与格式
#[async_trait]
pub trait ConvertStrategy: Send + Sync {
    async fn convert(&self, source: &Path, target: &Path, opts: &ConvertOptions) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// trace-cmd 剖析包装：start 拉起记录进程，stop 发 SIGINT 收尾
struct TraceGuard {
    child: Child,
    runner: CmdRunner,
    output: PathBuf,
}

impl TraceGuard {
    async fn start(
        runner: &CmdRunner,
        prefix: &str,
        numa_node: Option<u32>,
        debug_level: bool,
    ) -> Result<Self> {
        let (_, output) = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile()?
            .keep()
            .map_err(|e| ImgError::Io(e.error))?;

        let mut cmd = Vec::new();
        if let Some(node) = numa_node {
            // 记录进程钉在未被转换占用的另一个节点上
            cmd.extend(numa_restrict_argv(if node > 0 { 0 } else { 1 }));
        }
        cmd.extend(argv(&[
            "trace-cmd",
            "record",
            "-o",
            &output.display().to_string(),
            "-e",
            "sched",
            "-e",
            "syscalls",
            "-e",
            "irq",
        ]));
        if !debug_level {
            cmd.push("-q".to_string());
        }

        let child = runner.spawn_background(&cmd)?;
        Ok(Self {
            child,
            runner: runner.clone(),
            output,
        })
    }

    async fn stop(mut self) {
        if let Some(pid) = self.child.id() {
            let _ = self
                .runner
                .run_lenient(&argv(&["kill", "-INT", &pid.to_string()]))
                .await;
        }
        let _ = self.child.wait().await;
        info!("剖析数据写入 {}", self.output.display());
    }
}

async fn maybe_trace(
    runner: &CmdRunner,
    prefix: &str,
    opts: &ConvertOptions,
) -> Result<Option<TraceGuard>> {
    if !opts.trace {
        return Ok(None);
    }
    Ok(Some(
        TraceGuard::start(runner, prefix, opts.numa_node, opts.verbosity.verbose >= 2).await?,
    ))
}

/// 兼容引擎：virt-v2v 整盘转换
///
/// 产物名由 virt-v2v 自定（`<stem>-sda`），转换后改名成约定的目标名。
pub struct V2vStrategy {
    runner: CmdRunner,
}

impl V2vStrategy {
    pub fn new(runner: CmdRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConvertStrategy for V2vStrategy {
    async fn convert(&self, source: &Path, target: &Path, opts: &ConvertOptions) -> Result<()> {
        let ext = opts.format.extension().unwrap_or("qcow2");
        let out_dir = target.parent().unwrap_or(Path::new("."));

        let trace = maybe_trace(&self.runner, "trace-v2v.dat-", opts).await?;

        let mut cmd = Vec::new();
        if let Some(node) = opts.numa_node {
            cmd.extend(numa_restrict_argv(node));
        }
        cmd.extend(argv(&[
            "virt-v2v",
            "--root=first",
            "-i",
            "disk",
            "-o",
            "disk",
            "-of",
            ext,
            "-os",
            &out_dir.display().to_string(),
        ]));
        if opts.verbosity.quiet > 0 {
            cmd.push("--quiet".to_string());
        }
        if opts.verbosity.verbose >= 2 {
            cmd.push("-x".to_string());
        }
        cmd.push(source.display().to_string());

        let result = self.runner.run_lenient(&cmd).await?;
        if let Some(guard) = trace {
            guard.stop().await;
        }
        match result {
            Some(_) => info!("virt-v2v: 转换 {} 成功", source.display()),
            None => warn!("virt-v2v: 转换 {} 报告失败", source.display()),
        }

        rename_v2v_artifact(target).await
    }

    fn name(&self) -> &'static str {
        "v2v"
    }
}

/// virt-v2v 按自己的命名落盘，找到唯一的 `<stem>-sd*` 产物并改名
async fn rename_v2v_artifact(target: &Path) -> Result<()> {
    let dir = target.parent().unwrap_or(Path::new("."));
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!("{stem}-sd");

    let mut matches = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            matches.push(entry.path());
        }
    }

    if matches.len() != 1 {
        return Err(ImgError::MissingArtifact(target.to_path_buf()));
    }
    debug!("{} -> {}", matches[0].display(), target.display());
    tokio::fs::rename(&matches[0], target).await?;
    Ok(())
}

/// 直连引擎：qemu-img convert 一步拷贝
pub struct QemuImgStrategy {
    runner: CmdRunner,
}

impl QemuImgStrategy {
    pub fn new(runner: CmdRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConvertStrategy for QemuImgStrategy {
    async fn convert(&self, source: &Path, target: &Path, opts: &ConvertOptions) -> Result<()> {
        let ext = opts.format.extension().unwrap_or("qcow2");
        let trace = maybe_trace(&self.runner, "trace-qemu-img.dat-", opts).await?;

        let mut cmd = Vec::new();
        if let Some(node) = opts.numa_node {
            cmd.extend(numa_restrict_argv(node));
        }
        cmd.extend(argv(&[
            "qemu-img",
            "convert",
            "-O",
            ext,
            "-t",
            &opts.cache_mode,
            "-T",
            &opts.cache_mode,
        ]));
        if let Some(parallel) = opts.parallel {
            cmd.push("-m".to_string());
            cmd.push(parallel.to_string());
        }
        if opts.verbosity.quiet == 0 {
            cmd.push("-p".to_string());
        }
        cmd.push(source.display().to_string());
        cmd.push(target.display().to_string());

        let result = self.runner.run(&cmd).await;
        if let Some(guard) = trace {
            guard.stop().await;
        }
        result?;
        info!("qemu-img: 转换 {} 完成", source.display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "qemu-img"
    }
}

/// 一个 qemu-nbd 服务端点，socket 放在独占临时目录里
struct NbdEndpoint {
    child: Child,
    socket: PathBuf,
    _dir: TempDir,
}

impl NbdEndpoint {
    async fn start(
        runner: &CmdRunner,
        disk: &Path,
        cache_mode: &str,
        raw: bool,
        readonly: bool,
    ) -> Result<Self> {
        let dir = TempDir::new()?;
        let socket = dir.path().join("nbd.sock");

        let mut cmd = argv(&[
            "qemu-nbd",
            &format!("--cache={cache_mode}"),
            "-t",
            "--shared=0",
            "--discard=unmap",
            "--socket",
            &socket.display().to_string(),
        ]);
        if raw {
            cmd.push("-f".to_string());
            cmd.push("raw".to_string());
        }
        if readonly {
            cmd.push("-r".to_string());
        }
        cmd.push(disk.display().to_string());

        let child = runner.spawn_background(&cmd)?;
        let endpoint = Self {
            child,
            socket,
            _dir: dir,
        };
        endpoint.wait_ready(runner).await?;
        Ok(endpoint)
    }

    /// nbdinfo 轮询到端点可用为止
    async fn wait_ready(&self, runner: &CmdRunner) -> Result<()> {
        let uri = self.uri();
        for _ in 0..30 {
            let probe = runner.run_lenient(&argv(&["nbdinfo", &uri])).await?;
            if probe.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(ImgError::NbdTimeout(self.socket.clone()))
    }

    fn uri(&self) -> String {
        format!("nbd+unix:///?socket={}", self.socket.display())
    }

    async fn stop(mut self, runner: &CmdRunner) {
        if let Some(pid) = self.child.id() {
            let _ = runner
                .run_lenient(&argv(&["kill", "-TERM", &pid.to_string()]))
                .await;
        }
        let _ = self.child.wait().await;
    }
}

/// 实验性拷贝路径：两端 qemu-nbd 暴露块设备，nbdcopy 搬运
pub struct NbdCopyStrategy {
    runner: CmdRunner,
}

impl NbdCopyStrategy {
    pub fn new(runner: CmdRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConvertStrategy for NbdCopyStrategy {
    async fn convert(&self, source: &Path, target: &Path, opts: &ConvertOptions) -> Result<()> {
        let ext = opts.format.extension().unwrap_or("qcow2");
        let raw = ext == "raw";

        // 目标文件按源盘虚拟大小预建
        let vsize = qemu_img_info(&self.runner, source).await?;
        let mut create = argv(&["qemu-img", "create", "-f", ext]);
        if opts.verbosity.verbose < 2 {
            create.push("-q".to_string());
        }
        create.push(target.display().to_string());
        create.push(vsize.to_string());
        self.runner.run(&create).await?;

        let src = NbdEndpoint::start(&self.runner, source, &opts.cache_mode, false, true).await?;
        let dst = match NbdEndpoint::start(&self.runner, target, &opts.cache_mode, raw, false).await
        {
            Ok(ep) => ep,
            Err(err) => {
                src.stop(&self.runner).await;
                return Err(err);
            }
        };

        let trace = maybe_trace(&self.runner, "trace-nbdcopy.dat-", opts).await?;

        let mut cmd = Vec::new();
        if let Some(node) = opts.numa_node {
            cmd.extend(numa_restrict_argv(node));
        }
        cmd.extend(argv(&[
            "nbdcopy",
            &src.uri(),
            &dst.uri(),
            "--requests=64",
            "--flush",
            "--progress",
        ]));
        if let Some(parallel) = opts.parallel {
            cmd.push("-C".to_string());
            cmd.push(parallel.to_string());
            cmd.push("-T".to_string());
            cmd.push(parallel.to_string());
        }

        let result = self.runner.run(&cmd).await;
        if let Some(guard) = trace {
            guard.stop().await;
        }
        // 端点无论拷贝成败都要收掉
        src.stop(&self.runner).await;
        dst.stop(&self.runner).await;

        result?;
        info!("nbdcopy: 转换 {} 完成", source.display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nbdcopy"
    }
}
