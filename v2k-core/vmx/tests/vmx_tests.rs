//! VMX 解析模块测试

use v2k_vmx::{DiskBus, VmxDocument};

/// 一份贴近真实导出的描述符
const REAL_WORLD_VMX: &str = r#"
.encoding = "UTF-8"
config.version = "8"
virtualHW.version = "19"
displayName = "web-frontend-01"
guestOS = "sles15-64"
firmware = "efi"
nvram = "web-frontend-01.nvram"
memSize = "8192"
numvcpus = "4"
cpuid.coresPerSocket = "2"
vm.genid = "5106784185605983626"
vm.genidx = "-7663733613895827237"
hpet0.present = "TRUE"
sound.present = "TRUE"
sound.virtualDev = "hdaudio"
scsi0.present = "TRUE"
scsi0.virtualDev = "pvscsi"
scsi0:0.present = "TRUE"
scsi0:0.fileName = "/vmfs/volumes/datastore1/web-frontend-01/web-frontend-01.vmdk"
scsi0:0.mode = "persistent"
scsi0:1.present = "TRUE"
scsi0:1.fileName = "/vmfs/volumes/datastore2/web-frontend-01/web-frontend-01_1.vmdk"
sata0.present = "TRUE"
sata0:0.present = "TRUE"
sata0:0.deviceType = "cdrom-image"
sata0:0.fileName = "/vmfs/volumes/isos/sle-15-SP5.iso"
ethernet0.present = "TRUE"
ethernet0.connectionType = "bridged"
ethernet0.networkName = "VM Network"
ethernet0.virtualDev = "vmxnet3"
ethernet0.addressType = "generated"
ethernet0.generatedAddress = "00:0c:29:12:34:56"
ethernet1.present = "TRUE"
ethernet1.connectionType = "custom"
ethernet1.networkName = "dmz-net"
ethernet1.virtualDev = "e1000e"
ethernet1.addressType = "static"
ethernet1.address = "00:50:56:01:02:03"
"#;

#[test]
fn test_real_world_scalars() {
    let doc = VmxDocument::parse(REAL_WORLD_VMX).unwrap();

    assert_eq!(doc.display_name(), Some("web-frontend-01"));
    assert_eq!(doc.memory_mb(), Some(8192));
    assert_eq!(doc.num_vcpus(), Some(4));
    assert_eq!(doc.cores_per_socket(), Some(2));
    assert!(doc.firmware_is_efi());
    assert_eq!(doc.nvram(), Some("web-frontend-01.nvram"));
    assert_eq!(doc.guest_os(), Some("sles15-64"));
    assert!(doc.hpet_present());
    assert_eq!(doc.sound_virtual_dev(), Some("hdaudio"));
    assert_eq!(
        doc.generation_id(),
        Some((5106784185605983626, -7663733613895827237))
    );
}

#[test]
fn test_real_world_devices() {
    let doc = VmxDocument::parse(REAL_WORLD_VMX).unwrap();

    let disks = doc.disks();
    assert_eq!(disks.len(), 3);

    // 枚举顺序确定：scsi 在前，再 sata
    assert_eq!(disks[0].bus, DiskBus::Scsi);
    assert_eq!((disks[0].controller, disks[0].unit), (0, 0));
    assert_eq!(
        disks[0].filename,
        "/vmfs/volumes/datastore1/web-frontend-01/web-frontend-01.vmdk"
    );
    assert!(!disks[0].is_cdrom());

    assert_eq!((disks[1].controller, disks[1].unit), (0, 1));

    assert_eq!(disks[2].bus, DiskBus::Sata);
    assert!(disks[2].is_cdrom());

    let nics = doc.ethernets();
    assert_eq!(nics.len(), 2);
    assert_eq!(nics[0].network_name, "VM Network");
    assert_eq!(nics[0].virtual_dev, "vmxnet3");
    assert_eq!(nics[1].mac.as_deref(), Some("00:50:56:01:02:03"));
}

#[test]
fn test_parse_is_deterministic() {
    let a = VmxDocument::parse(REAL_WORLD_VMX).unwrap();
    let b = VmxDocument::parse(REAL_WORLD_VMX).unwrap();
    let ka: Vec<_> = a.iter().collect();
    let kb: Vec<_> = b.iter().collect();
    assert_eq!(ka, kb);
}

#[tokio::test]
async fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm.vmx");
    tokio::fs::write(&path, REAL_WORLD_VMX).await.unwrap();

    let doc = VmxDocument::load(&path).await.unwrap();
    assert_eq!(doc.display_name(), Some("web-frontend-01"));
}

#[tokio::test]
async fn test_load_missing_file() {
    let err = VmxDocument::load(std::path::Path::new("/nonexistent/vm.vmx"))
        .await
        .unwrap_err();
    assert!(matches!(err, v2k_vmx::VmxError::Io(_)));
}
