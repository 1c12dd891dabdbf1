//! V2K 客户机调整
//!
//! 就地修补转换后的客户机文件系统：重建 initrd 并注入 virtio
//! 驱动，使其能在目标虚拟化层上引导。Linux 客户机支持两种方法，
//! Windows 一律不支持——那种场合必须整体交给 virt-v2v 全量转换，
//! 半调整出一个引导不起来的系统比明确报错糟糕得多。

use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use v2k_common::Verbosity;
use v2k_runcmd::{argv, detect_version, CmdRunner, RunCmdError};

#[derive(Error, Debug)]
pub enum AdjustError {
    /// 不支持的客户机家族，调用方应改走外部全量转换工具
    #[error("客户机 {os:?} 不支持就地调整，请改用 virt-v2v 全量转换")]
    UnsupportedGuest { os: String },

    #[error("无法在 {0} 中识别出受支持的客户机系统")]
    UnknownGuest(String),

    #[error("客户机检视失败: {0}")]
    Inspection(String),

    #[error("客户机调整失败: {0}")]
    AdjustFailed(String),

    #[error(transparent)]
    RunCmd(#[from] RunCmdError),
}

pub type Result<T> = std::result::Result<T, AdjustError>;

/// 调整方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdjustMethod {
    /// 默认：virt-v2v-in-place 整机就地调整
    #[default]
    V2vInPlace,
    /// 实验性：libguestfs 脚本直改 initrd
    Experimental,
}

/// 检视得到的客户机系统信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsInfo {
    /// 系统家族（linux / windows / …）
    pub name: String,
    /// 发行版标识（sles15sp5 / win2k19 / …）
    pub osinfo: String,
}

impl OsInfo {
    pub fn is_windows(&self) -> bool {
        self.name.eq_ignore_ascii_case("windows")
    }

    pub fn is_linux(&self) -> bool {
        self.name.eq_ignore_ascii_case("linux")
    }
}

/// 从 virt-inspector 输出中刮取系统信息
fn parse_inspector_output(s: &str) -> OsInfo {
    let name_re = regex::Regex::new(r"(?m)^\s*<name>(.+)</name>\s*$").unwrap();
    let osinfo_re = regex::Regex::new(r"(?m)\s*<osinfo>(.+)</osinfo>\s*$").unwrap();
    OsInfo {
        name: name_re
            .captures(s)
            .map(|c| c[1].to_string())
            .unwrap_or_default(),
        osinfo: osinfo_re
            .captures(s)
            .map(|c| c[1].to_string())
            .unwrap_or_default(),
    }
}

/// 检视镜像里的客户机系统
pub async fn inspect(runner: &CmdRunner, disk: &Path) -> Result<OsInfo> {
    let out = runner
        .run_lenient(&argv(&[
            "virt-inspector",
            "--no-icon",
            "--no-applications",
            "--echo-keys",
            &disk.display().to_string(),
        ]))
        .await?;
    let Some(out) = out else {
        return Err(AdjustError::Inspection(format!(
            "{} 无法被检视",
            disk.display()
        )));
    };
    let osd = parse_inspector_output(&out.stdout);
    info!("[OS DATA] {} {}", osd.name, osd.osinfo);
    Ok(osd)
}

/// 客户机调整器
pub struct GuestAdjuster {
    runner: CmdRunner,
    method: AdjustMethod,
    verbosity: Verbosity,
}

impl GuestAdjuster {
    pub fn new(runner: CmdRunner) -> Self {
        Self {
            runner,
            method: AdjustMethod::default(),
            verbosity: Verbosity::default(),
        }
    }

    pub fn with_method(mut self, method: AdjustMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// 就地调整一块已转换的磁盘
    ///
    /// 先检视客户机家族：Windows 直接拒绝，识别不出的系统不动盘。
    pub async fn adjust(&self, disk: &Path) -> Result<()> {
        let osd = inspect(&self.runner, disk).await?;
        if osd.is_windows() {
            return Err(AdjustError::UnsupportedGuest { os: osd.osinfo });
        }
        if !osd.is_linux() {
            return Err(AdjustError::UnknownGuest(disk.display().to_string()));
        }

        info!(
            "开始调整 {}（方法 {:?}）",
            disk.display(),
            self.method
        );
        match self.method {
            AdjustMethod::V2vInPlace => self.adjust_v2v(disk).await,
            AdjustMethod::Experimental => self.adjust_guestfs(disk).await,
        }
    }

    /// virt-v2v-in-place 整机调整
    async fn adjust_v2v(&self, disk: &Path) -> Result<()> {
        let mut cmd = argv(&["virt-v2v-in-place", "--root=first", "-i", "disk"]);
        if self.verbosity.quiet > 0 {
            cmd.push("--quiet".to_string());
        }
        if self.verbosity.verbose >= 2 {
            cmd.push("-x".to_string());
        }
        cmd.push(disk.display().to_string());

        match self.runner.run_lenient(&cmd).await? {
            Some(_) => {
                info!("调整 {} 成功", disk.display());
                Ok(())
            }
            None => Err(AdjustError::AdjustFailed(format!(
                "virt-v2v-in-place 在 {} 上报告失败",
                disk.display()
            ))),
        }
    }

    /// 实验性方法：在客户机环境里重建 initrd
    ///
    /// 依次尝试各家发行版的 initrd 工具，第一个成功者生效。
    /// make-initrd 在虚拟化环境下会自动带上 virtio，其余工具
    /// 需要显式点名 virtio_pci/virtio_scsi/virtio_blk。
    async fn adjust_guestfs(&self, disk: &Path) -> Result<()> {
        const ATTEMPTS: [(&str, &str); 4] = [
            ("make-initrd", "make-initrd"),
            (
                "dracut",
                "dracut --force --regenerate-all --add-drivers 'virtio_pci virtio_scsi virtio_blk'",
            ),
            (
                "update-initramfs",
                "printf 'virtio_pci\\nvirtio_scsi\\nvirtio_blk\\n' >> /etc/initramfs-tools/modules && update-initramfs -c -k all",
            ),
            (
                "mkinitrd",
                "mkinitrd --with=virtio_pci --with=virtio_scsi --with=virtio_blk",
            ),
        ];

        for (tool, script) in ATTEMPTS {
            let probe = format!("command -v {tool} && {{ {script}; }}");
            let cmd = argv(&[
                "guestfish",
                "--rw",
                "-a",
                &disk.display().to_string(),
                "-i",
                "sh",
                &probe,
            ]);
            if self.runner.run_lenient(&cmd).await?.is_some() {
                info!("initrd 通过 {} 重建完成", tool);
                return Ok(());
            }
            warn!("{} 不可用或执行失败，尝试下一个", tool);
        }
        Err(AdjustError::AdjustFailed(
            "没有找到可用的 initrd 重建工具".to_string(),
        ))
    }

    /// 探测当前方法依赖的外部工具版本
    pub async fn detect_tool_version(&self) -> Result<f64> {
        let v = match self.method {
            AdjustMethod::V2vInPlace => {
                detect_version(
                    &argv(&["virt-v2v-in-place", "--version"]),
                    r"(\d+\.\d+)",
                )
                .await?
            }
            AdjustMethod::Experimental => {
                detect_version(&argv(&["guestfish", "--version"]), r"(\d+\.\d+)").await?
            }
        };
        Ok(v)
    }
}

/// virt-inspector 版本探测（注意版本号前是空格不是 v）
pub async fn detect_inspector() -> Result<f64> {
    Ok(detect_version(&argv(&["virt-inspector", "--version"]), r" (\d+\.\d+)").await?)
}
