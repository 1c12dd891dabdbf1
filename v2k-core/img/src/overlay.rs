//! 临时 qcow2 覆盖层
//!
//! 调整客户机文件系统时不直接动源盘：在源盘之上建一层
//! 一次性 qcow2 覆盖，写放大进覆盖层，拷贝完成即丢弃。

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

use crate::Result;
use v2k_runcmd::CmdRunner;

/// 以源盘为后备文件的一次性覆盖层，落盘在临时目录里，随值销毁
pub struct Overlay {
    path: PathBuf,
    _dir: TempDir,
}

impl Overlay {
    /// `qemu-img create -b {backing} -F {backing_format} -f qcow2`
    pub async fn create(
        runner: &CmdRunner,
        backing: &Path,
        backing_format: &str,
        quiet: bool,
    ) -> Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("overlay.qcow2");

        let mut argv = v2k_runcmd::argv(&[
            "qemu-img",
            "create",
            "-b",
            &backing.display().to_string(),
            "-F",
            backing_format,
            "-f",
            "qcow2",
        ]);
        if quiet {
            argv.push("-q".to_string());
        }
        argv.push(path.display().to_string());

        runner.run(&argv).await?;
        debug!("覆盖层 {} (后备 {})", path.display(), backing.display());
        Ok(Self { path, _dir: dir })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
