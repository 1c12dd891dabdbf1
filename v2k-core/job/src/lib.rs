//! V2K 转换任务
//!
//! 一个任务对应一台虚拟机的完整流水线：
//!
//! ```text
//! 解析 → 映射 → 合成描述符 → [磁盘转换] → [客户机调整] → [启动验证]
//! ```
//!
//! 方括号阶段可独立跳过、独立重跑。任务状态只活在文件系统工件里
//! （描述符、转换盘、日志），重跑靠检查工件重建状态：已存在的转换
//! 产物绝不静默重做，便宜的描述符阶段可以廉价反复跑。任务之间
//! 互不影响，失败从不串联到兄弟任务。

mod config;
mod log_file;

pub use config::JobConfig;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use log_file::JobLog;
use v2k_adjust::{AdjustError, GuestAdjuster};
use v2k_boottest::BootValidator;
use v2k_common::{ImageFormat, JobOutcome};
use v2k_domain::{DomainBuilder, DomainError, PlannedDisk, TargetDescriptor};
use v2k_img::{ConvertOptions, ImgError, Overlay};
use v2k_mapper::{DatastoreMap, NetworkMap, Resolution};
use v2k_runcmd::CmdRunner;
use v2k_vmx::{VmxDocument, VmxError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Vmx(#[from] VmxError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Img(#[from] ImgError),

    #[error(transparent)]
    Adjust(#[from] AdjustError),

    #[error("无法从映射规则推导输出描述符路径，请显式指定 --output-xml: {0}")]
    OutputPath(PathBuf),

    #[error("写出工件失败: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// 错误到单行分类结果的折叠
    pub fn outcome(&self) -> JobOutcome {
        match self {
            JobError::Vmx(_) => JobOutcome::ParseFailure,
            JobError::Domain(DomainError::Mapping(_)) => JobOutcome::MapFailure,
            JobError::Domain(_) => JobOutcome::ScriptFailure,
            JobError::Img(_) => JobOutcome::ConvFailure,
            JobError::Adjust(_) => JobOutcome::AdjustFailure,
            JobError::OutputPath(_) => JobOutcome::MapFailure,
            JobError::Io(_) => JobOutcome::ScriptFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

/// 单个阶段的执行记录
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: &'static str,
    pub skipped: bool,
    pub elapsed: Duration,
}

/// 任务执行报告
#[derive(Debug)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub stages: Vec<StageReport>,
    /// 写出的目标描述符路径（未走到该阶段则为空）
    pub xml_path: Option<PathBuf>,
}

/// 一台虚拟机的转换任务，独占其全部目标工件
pub struct ConversionJob {
    config: JobConfig,
}

impl ConversionJob {
    pub fn new(config: JobConfig) -> Self {
        Self { config }
    }

    /// 执行流水线，任何失败都折叠成分类结果，不向外抛
    pub async fn run(&self) -> JobReport {
        let mut report = JobReport {
            outcome: JobOutcome::Success,
            stages: Vec::new(),
            xml_path: None,
        };
        if let Err(err) = self.run_inner(&mut report).await {
            warn!("{}", err);
            report.outcome = err.outcome();
        }
        report
    }

    async fn run_inner(&self, report: &mut JobReport) -> Result<()> {
        let cfg = &self.config;

        // 解析
        let started = Instant::now();
        let doc = VmxDocument::load(&cfg.vmx_path).await?;
        report.stages.push(StageReport {
            name: "parse",
            skipped: false,
            elapsed: started.elapsed(),
        });

        // 输出路径与工件
        let xml_path = self.resolve_output_path()?;
        let xml_dir = xml_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        tokio::fs::create_dir_all(&xml_dir).await?;

        let log = JobLog::new(artifact_path(&xml_path, "log"));
        let runner = CmdRunner::new().with_capture(artifact_path(&xml_path, "out.log"));
        log.append(&format!("任务开始: {}", cfg.vmx_path.display()))
            .await;

        // 映射 + 合成描述符
        let started = Instant::now();
        let datastores = DatastoreMap::new(cfg.datastores.clone());
        let networks = NetworkMap::new(cfg.networks.clone(), cfg.default_network.clone());

        let fallback_name = cfg
            .vmx_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
        let mut builder = DomainBuilder::new(&doc, &datastores, &networks)
            .with_mode(cfg.mode)
            .with_format(cfg.format)
            .with_nvram_dir(xml_dir.clone());
        if let Some(dir) = cfg.vmx_path.parent() {
            builder = builder.with_vmx_dir(dir.to_path_buf());
        }
        if let Some(name) = fallback_name {
            builder = builder.with_fallback_name(name);
        }

        // 映射失败在这里中止，任何描述符内容都不落盘
        let descriptor = builder.build()?;
        tokio::fs::write(&xml_path, &descriptor.xml).await?;
        report.xml_path = Some(xml_path.clone());
        let elapsed = started.elapsed();
        log.append(&format!("描述符写出: {}", xml_path.display()))
            .await;
        report.stages.push(StageReport {
            name: "descriptor",
            skipped: false,
            elapsed,
        });

        // 磁盘转换
        if cfg.translate_disks && cfg.format != ImageFormat::None {
            self.convert_disks(&descriptor, &runner, &log, report).await?;
        } else {
            report.stages.push(StageReport {
                name: "convert",
                skipped: true,
                elapsed: Duration::ZERO,
            });
        }

        // 客户机调整（覆盖层路径在转换阶段顺带完成）
        if cfg.adjust && !cfg.overlay_adjust {
            let started = Instant::now();
            self.adjust_os_disk(&descriptor, &runner, &log).await?;
            report.stages.push(StageReport {
                name: "adjust",
                skipped: false,
                elapsed: started.elapsed(),
            });
        } else {
            // 覆盖层模式下调整已在转换阶段顺带完成
            report.stages.push(StageReport {
                name: "adjust",
                skipped: true,
                elapsed: Duration::ZERO,
            });
        }

        // 启动验证
        if let Some(timeout) = cfg.boot_test {
            let started = Instant::now();
            let validator = BootValidator::new()
                .with_uri(cfg.connect_uri.clone())
                .with_timeout(timeout)
                .with_probe(cfg.probe.build())
                .with_isolated(cfg.isolated)
                .with_keep(cfg.keep);
            let outcome = validator.validate(&xml_path).await;
            log.append(&format!("启动验证结果: {:?}", outcome)).await;
            report.stages.push(StageReport {
                name: "boottest",
                skipped: false,
                elapsed: started.elapsed(),
            });
            report.outcome = outcome.into();
        } else {
            report.stages.push(StageReport {
                name: "boottest",
                skipped: true,
                elapsed: Duration::ZERO,
            });
        }

        for stage in &report.stages {
            if stage.skipped {
                log.append(&format!("阶段 {}: 跳过", stage.name)).await;
            } else {
                log.append(&format!(
                    "阶段 {}: 耗时 {:.2}s",
                    stage.name,
                    stage.elapsed.as_secs_f64()
                ))
                .await;
            }
        }
        log.append(&format!("任务结束: {}", report.outcome)).await;
        Ok(())
    }

    /// 输出描述符路径：显式指定优先，否则把源路径过一遍映射规则、
    /// 扩展名换成 .xml
    fn resolve_output_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.output_xml {
            return Ok(path.clone());
        }
        let datastores = DatastoreMap::new(self.config.datastores.clone());
        match datastores.resolve(&self.config.vmx_path) {
            Resolution::Mapped { target_path, .. } => Ok(target_path.with_extension("xml")),
            _ => Err(JobError::OutputPath(self.config.vmx_path.clone())),
        }
    }

    async fn convert_disks(
        &self,
        descriptor: &TargetDescriptor,
        runner: &CmdRunner,
        log: &JobLog,
        report: &mut JobReport,
    ) -> Result<()> {
        let cfg = &self.config;
        let strategy = v2k_img::select_strategy(cfg.engine, cfg.nbd_copy, runner.clone());
        let opts = ConvertOptions {
            format: cfg.format,
            cache_mode: cfg.cache_mode.clone(),
            parallel: cfg.parallel,
            numa_node: cfg.numa_node,
            trace: cfg.trace,
            verbosity: cfg.verbosity,
        };

        let started = Instant::now();
        let mut converted = 0usize;
        let mut skipped = 0usize;

        for disk in self.disks_in_scope(descriptor) {
            let Some(target) = &disk.convert_to else {
                continue;
            };
            // 已存在的产物绝不静默重做，这是廉价重跑的根基
            if tokio::fs::try_exists(target).await.unwrap_or(false) {
                info!("{} 已存在，跳过转换", target.display());
                log.append(&format!("跳过已有产物: {}", target.display()))
                    .await;
                skipped += 1;
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            if cfg.adjust && cfg.overlay_adjust && disk.os_disk {
                // 覆盖层路径：调整写进一次性覆盖层，源盘保持原样
                let overlay = Overlay::create(
                    runner,
                    &disk.host_path,
                    "vmdk",
                    cfg.verbosity.verbose < 2,
                )
                .await?;
                let adjuster = GuestAdjuster::new(runner.clone())
                    .with_method(cfg.adjust_method)
                    .with_verbosity(cfg.verbosity);
                adjuster.adjust(overlay.path()).await?;
                strategy.convert(overlay.path(), target, &opts).await?;
            } else {
                strategy.convert(&disk.host_path, target, &opts).await?;
            }
            log.append(&format!(
                "磁盘转换完成 ({}): {} -> {}",
                strategy.name(),
                disk.host_path.display(),
                target.display()
            ))
            .await;
            converted += 1;
        }

        info!("磁盘转换: {} 个完成, {} 个沿用已有产物", converted, skipped);
        report.stages.push(StageReport {
            name: "convert",
            skipped: false,
            elapsed: started.elapsed(),
        });
        Ok(())
    }

    /// 转换范围：OS 盘快速迭代模式只取引导盘，完整迁移取全部。
    /// 直通与光驱设备天然不在内（没有转换目标）。
    fn disks_in_scope<'d>(&self, descriptor: &'d TargetDescriptor) -> Vec<&'d PlannedDisk> {
        descriptor
            .disks
            .iter()
            .filter(|d| d.needs_conversion())
            .filter(|d| !self.config.os_disk_only || d.os_disk)
            .collect()
    }

    /// 就地调整描述符所引用的 OS 盘
    async fn adjust_os_disk(
        &self,
        descriptor: &TargetDescriptor,
        runner: &CmdRunner,
        log: &JobLog,
    ) -> Result<()> {
        let Some(os_disk) = descriptor.disks.iter().find(|d| d.os_disk) else {
            warn!("没有可调整的 OS 盘");
            return Ok(());
        };
        // 调整描述符实际引用的那份镜像
        let target = os_disk.convert_to.as_ref().unwrap_or(&os_disk.host_path);

        let adjuster = GuestAdjuster::new(runner.clone())
            .with_method(self.config.adjust_method)
            .with_verbosity(self.config.verbosity);
        adjuster.adjust(target).await?;
        log.append(&format!("客户机调整完成: {}", target.display()))
            .await;
        Ok(())
    }
}

/// 描述符旁的工件路径：`vm1.xml` → `vm1.log` / `vm1.out.log`
fn artifact_path(xml_path: &Path, ext: &str) -> PathBuf {
    xml_path.with_extension(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use v2k_mapper::MappingRule;

    #[test]
    fn test_artifact_paths() {
        let xml = Path::new("/dst/vm1/vm1.xml");
        assert_eq!(artifact_path(xml, "log"), Path::new("/dst/vm1/vm1.log"));
        assert_eq!(
            artifact_path(xml, "out.log"),
            Path::new("/dst/vm1/vm1.out.log")
        );
    }

    #[test]
    fn test_output_path_derived_from_rules() {
        let mut cfg = JobConfig::new(PathBuf::from("/vmfs/volumes/datastore1/vm1/vm1.vmx"));
        cfg.datastores = vec![MappingRule::new("/vmfs/volumes/datastore1", "/src", "/dst")];
        let job = ConversionJob::new(cfg);
        assert_eq!(
            job.resolve_output_path().unwrap(),
            PathBuf::from("/dst/vm1/vm1.xml")
        );
    }

    #[test]
    fn test_output_path_requires_rule_or_flag() {
        let cfg = JobConfig::new(PathBuf::from("/elsewhere/vm1.vmx"));
        let job = ConversionJob::new(cfg);
        assert!(matches!(
            job.resolve_output_path().unwrap_err(),
            JobError::OutputPath(_)
        ));
    }

    #[test]
    fn test_explicit_output_path_wins() {
        let mut cfg = JobConfig::new(PathBuf::from("/elsewhere/vm1.vmx"));
        cfg.output_xml = Some(PathBuf::from("/out/vm1.xml"));
        let job = ConversionJob::new(cfg);
        assert_eq!(
            job.resolve_output_path().unwrap(),
            PathBuf::from("/out/vm1.xml")
        );
    }

    #[test]
    fn test_error_outcome_classification() {
        let err = JobError::OutputPath(PathBuf::from("x"));
        assert_eq!(err.outcome(), JobOutcome::MapFailure);
        let err = JobError::Io(std::io::Error::other("boom"));
        assert_eq!(err.outcome(), JobOutcome::ScriptFailure);
    }
}
