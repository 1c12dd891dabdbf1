//! 设备坐标枚举
//!
//! 描述符里 `(总线, 控制器, 单元)` 三元组唯一标识一个逻辑设备。
//! 各总线的控制器/单元上限取自源虚拟化平台的设备模型。

use crate::VmxDocument;

/// 磁盘总线类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskBus {
    Scsi,
    Sata,
    Nvme,
    Ide,
}

impl DiskBus {
    /// 枚举顺序固定：scsi → sata → nvme → ide
    pub const ALL: [DiskBus; 4] = [DiskBus::Scsi, DiskBus::Sata, DiskBus::Nvme, DiskBus::Ide];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Nvme => "nvme",
            DiskBus::Ide => "ide",
        }
    }

    /// (控制器数, 每控制器单元数)
    fn limits(&self) -> (u32, u32) {
        match self {
            DiskBus::Scsi => (4, 16),
            DiskBus::Sata => (4, 30),
            DiskBus::Nvme => (4, 15),
            DiskBus::Ide => (2, 2),
        }
    }
}

/// 一个在位的磁盘类设备（含光驱）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    pub bus: DiskBus,
    pub controller: u32,
    pub unit: u32,
    /// 描述符中引用的后备文件路径，原样保留
    pub filename: String,
    pub device_type: String,
    pub mode: String,
}

impl DiskDevice {
    /// 光驱设备（cdrom-image / cdrom-raw / atapi-cdrom）
    pub fn is_cdrom(&self) -> bool {
        self.device_type.to_lowercase().contains("cdrom")
    }
}

/// 一个在位的网卡
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetDevice {
    pub index: u32,
    /// bridged / nat / hostonly / custom
    pub connection_type: String,
    pub network_name: String,
    /// 源端虚拟网卡型号（e1000 / e1000e / vmxnet3），可为空
    pub virtual_dev: String,
    /// 静态地址优先，其次已生成地址
    pub mac: Option<String>,
}

pub(crate) fn enumerate_disks(doc: &VmxDocument) -> Vec<DiskDevice> {
    let mut disks = Vec::new();
    for bus in DiskBus::ALL {
        let (controllers, units) = bus.limits();
        for c in 0..controllers {
            for u in 0..units {
                if !doc.get_bool(&format!("{}{}:{}.present", bus.as_str(), c, u)) {
                    continue;
                }
                let filename = doc.device_attr(bus, c, u, "filename");
                if filename.is_empty() {
                    continue;
                }
                disks.push(DiskDevice {
                    bus,
                    controller: c,
                    unit: u,
                    filename: filename.to_string(),
                    device_type: doc.device_attr(bus, c, u, "devicetype").to_string(),
                    mode: doc.device_attr(bus, c, u, "mode").to_string(),
                });
            }
        }
    }
    disks
}

pub(crate) fn enumerate_ethernets(doc: &VmxDocument) -> Vec<EthernetDevice> {
    let mut nics = Vec::new();
    for i in 0..10u32 {
        if !doc.get_bool(&format!("ethernet{i}.present")) {
            continue;
        }
        let addr_type = doc.get_str(&format!("ethernet{i}.addresstype"));
        let mac = if addr_type.eq_ignore_ascii_case("static") {
            doc.get(&format!("ethernet{i}.address"))
        } else {
            doc.get(&format!("ethernet{i}.generatedaddress"))
        };
        nics.push(EthernetDevice {
            index: i,
            connection_type: doc.get_str(&format!("ethernet{i}.connectiontype")).to_string(),
            network_name: doc.get_str(&format!("ethernet{i}.networkname")).to_string(),
            virtual_dev: doc.get_str(&format!("ethernet{i}.virtualdev")).to_string(),
            mac: mac.filter(|m| !m.is_empty()).map(|m| m.to_string()),
        });
    }
    nics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VmxDocument {
        VmxDocument::parse(concat!(
            "scsi0.present = \"TRUE\"\n",
            "scsi0:0.present = \"TRUE\"\n",
            "scsi0:0.filename = \"vm1.vmdk\"\n",
            "scsi0:1.present = \"TRUE\"\n",
            "scsi0:1.filename = \"data.vmdk\"\n",
            "sata0:0.present = \"TRUE\"\n",
            "sata0:0.filename = \"install.iso\"\n",
            "sata0:0.devicetype = \"cdrom-image\"\n",
            "ide0:0.present = \"FALSE\"\n",
            "ethernet0.present = \"TRUE\"\n",
            "ethernet0.connectiontype = \"bridged\"\n",
            "ethernet0.virtualdev = \"vmxnet3\"\n",
            "ethernet0.addresstype = \"generated\"\n",
            "ethernet0.generatedaddress = \"00:0c:29:aa:bb:cc\"\n",
        ))
        .unwrap()
    }

    #[test]
    fn test_enumerate_disks() {
        let disks = sample().disks();
        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].bus, DiskBus::Scsi);
        assert_eq!(disks[0].filename, "vm1.vmdk");
        assert_eq!(disks[1].unit, 1);
        assert_eq!(disks[2].bus, DiskBus::Sata);
        assert!(disks[2].is_cdrom());
    }

    #[test]
    fn test_absent_disk_skipped() {
        let disks = sample().disks();
        assert!(!disks.iter().any(|d| d.bus == DiskBus::Ide));
    }

    #[test]
    fn test_controller_key_not_a_device() {
        // scsi0.present 是控制器键，没有单元坐标，不是磁盘
        let disks = sample().disks();
        assert!(disks.iter().all(|d| !d.filename.is_empty()));
    }

    #[test]
    fn test_enumerate_ethernets() {
        let nics = sample().ethernets();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].connection_type, "bridged");
        assert_eq!(nics[0].mac.as_deref(), Some("00:0c:29:aa:bb:cc"));
    }

    #[test]
    fn test_static_mac_preferred() {
        let doc = VmxDocument::parse(concat!(
            "ethernet0.present = \"TRUE\"\n",
            "ethernet0.addresstype = \"static\"\n",
            "ethernet0.address = \"00:50:56:00:00:01\"\n",
            "ethernet0.generatedaddress = \"00:0c:29:ff:ff:ff\"\n",
        ))
        .unwrap();
        assert_eq!(doc.ethernets()[0].mac.as_deref(), Some("00:50:56:00:00:01"));
    }
}
