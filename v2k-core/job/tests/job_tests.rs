//! 转换任务流水线测试
//!
//! 只覆盖不依赖外部工具链的阶段：解析、映射、描述符合成、
//! 工件落盘与重跑语义。

use std::path::PathBuf;

use v2k_common::JobOutcome;
use v2k_job::{ConversionJob, JobConfig};
use v2k_mapper::MappingRule;

const VMX: &str = r#"
displayName = "vm1"
memSize = "2048"
numvcpus = "2"
scsi0:0.present = "TRUE"
scsi0:0.fileName = "vm1.vmdk"
ethernet0.present = "TRUE"
ethernet0.connectionType = "bridged"
ethernet0.networkName = "VM Network"
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    vmx_path: PathBuf,
    src_root: PathBuf,
    dst_root: PathBuf,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let src_root = dir.path().join("src");
    let dst_root = dir.path().join("dst");
    let vm_dir = src_root.join("vm1");
    tokio::fs::create_dir_all(&vm_dir).await.unwrap();
    let vmx_path = vm_dir.join("vm1.vmx");
    tokio::fs::write(&vmx_path, VMX).await.unwrap();

    Fixture {
        _dir: dir,
        vmx_path,
        src_root,
        dst_root,
    }
}

fn config(f: &Fixture) -> JobConfig {
    let mut cfg = JobConfig::new(f.vmx_path.clone());
    cfg.datastores = vec![MappingRule::new(
        "/vmfs/volumes/datastore1",
        &f.src_root,
        &f.dst_root,
    )];
    cfg
}

#[tokio::test]
async fn test_descriptor_only_run() {
    let f = fixture().await;
    let job = ConversionJob::new(config(&f));

    let report = job.run().await;
    assert_eq!(report.outcome, JobOutcome::Success);

    let xml_path = f.dst_root.join("vm1/vm1.xml");
    assert_eq!(report.xml_path.as_deref(), Some(xml_path.as_path()));
    let xml = tokio::fs::read_to_string(&xml_path).await.unwrap();
    assert!(xml.contains("<name>vm1</name>"));
    // 转换产物路径指向未来的 qcow2 工件
    assert!(xml.contains("vm1.qcow2"));

    // 描述符旁有日志工件
    let log = tokio::fs::read_to_string(f.dst_root.join("vm1/vm1.log"))
        .await
        .unwrap();
    assert!(log.contains("任务开始"));
    assert!(log.contains("任务结束: SUCCESS"));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let f = fixture().await;
    let xml_path = f.dst_root.join("vm1/vm1.xml");

    let report = ConversionJob::new(config(&f)).run().await;
    assert_eq!(report.outcome, JobOutcome::Success);
    let first = tokio::fs::read_to_string(&xml_path).await.unwrap();

    let report = ConversionJob::new(config(&f)).run().await;
    assert_eq!(report.outcome, JobOutcome::Success);
    let second = tokio::fs::read_to_string(&xml_path).await.unwrap();

    // 同样输入重跑产出逐字节相同的描述符
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_existing_artifact_not_reconverted() {
    let f = fixture().await;
    // 转换产物已在计算出的目标路径上：转换阶段必须原样沿用，
    // 不调用任何外部工具（本测试环境里也没有可调用的）
    let artifact = f.dst_root.join("vm1/vm1.qcow2");
    tokio::fs::create_dir_all(artifact.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&artifact, b"fake qcow2").await.unwrap();

    let mut cfg = config(&f);
    cfg.translate_disks = true;

    let report = ConversionJob::new(cfg).run().await;
    assert_eq!(report.outcome, JobOutcome::Success);

    // 产物未被重写
    let content = tokio::fs::read(&artifact).await.unwrap();
    assert_eq!(content, b"fake qcow2");

    let stage = report
        .stages
        .iter()
        .find(|s| s.name == "convert")
        .unwrap();
    assert!(!stage.skipped);
}

#[tokio::test]
async fn test_unmapped_disk_no_artifacts() {
    let f = fixture().await;
    let mut cfg = config(&f);
    // 规则指向别的数据存储，vm1 的磁盘无规则覆盖
    cfg.datastores = vec![MappingRule::new(
        "/vmfs/volumes/other",
        "/mnt/other",
        &f.dst_root,
    )];
    cfg.output_xml = Some(f.dst_root.join("vm1/vm1.xml"));

    let report = ConversionJob::new(cfg).run().await;
    assert_eq!(report.outcome, JobOutcome::MapFailure);
    // 映射失败在写出任何描述符之前中止
    assert!(!f.dst_root.join("vm1/vm1.xml").exists());
}

#[tokio::test]
async fn test_missing_vmx_is_parse_failure() {
    let f = fixture().await;
    let mut cfg = config(&f);
    cfg.vmx_path = f.src_root.join("vm1/nonexistent.vmx");

    let report = ConversionJob::new(cfg).run().await;
    assert_eq!(report.outcome, JobOutcome::ParseFailure);
}

#[tokio::test]
async fn test_stage_skip_flags() {
    let f = fixture().await;
    let report = ConversionJob::new(config(&f)).run().await;

    let stage = |name: &str| {
        report
            .stages
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("缺少阶段 {name}"))
    };
    assert!(!stage("parse").skipped);
    assert!(!stage("descriptor").skipped);
    // 未开启的昂贵阶段全部记为跳过
    assert!(stage("convert").skipped);
    assert!(stage("adjust").skipped);
    assert!(stage("boottest").skipped);
}
