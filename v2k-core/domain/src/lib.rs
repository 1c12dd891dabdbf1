//! V2K 域构建器
//!
//! 由解析后的源文档加上存储/网络映射决策，合成目标域描述符。
//! 同样的输入（文档 + 规则 + 模式）永远产生逐字节相同的输出，
//! 这是流水线幂等重跑的前提。映射失败在写出任何内容之前中止。

mod xml;

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use v2k_common::ImageFormat;
use v2k_mapper::{DatastoreMap, MapperError, NetworkMap, NetworkTarget, Resolution};
use v2k_vmx::{DiskBus, DiskDevice, VmxDocument};

/// SUSE 发行版的 OVMF 固件与变量模板路径
const OVMF_CODE: &str = "/usr/share/qemu/ovmf-x86_64-smm-code.bin";
const OVMF_VARS: &str = "/usr/share/qemu/ovmf-x86_64-smm-vars.bin";

#[derive(Error, Debug)]
pub enum DomainError {
    #[error(transparent)]
    Mapping(#[from] MapperError),

    #[error("源描述符没有 displayname，且未提供回退名称")]
    MissingName,

    #[error("生成域描述符失败: {0}")]
    Emit(#[from] quick_xml::DeError),
}

pub type Result<T> = std::result::Result<T, DomainError>;

/// 磁盘翻译模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskMode {
    /// 尽量保留源端控制器总线与单元编址
    Fidelity,
    /// 全部磁盘归并到 virtio 块设备，牺牲硬件保真换吞吐
    #[default]
    Performance,
}

/// 一块磁盘的转换计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDisk {
    /// 源描述符中的引用写法（相对引用已归一到绝对路径）
    pub reference: PathBuf,
    /// 转换主机上的可达路径
    pub host_path: PathBuf,
    /// 计划生成的转换产物；直通、光驱或免转换格式时为 `None`
    pub convert_to: Option<PathBuf>,
    pub cdrom: bool,
    /// 枚举顺序中的首块数据盘，承载引导环境
    pub os_disk: bool,
}

impl PlannedDisk {
    pub fn needs_conversion(&self) -> bool {
        self.convert_to.is_some()
    }
}

/// 构建产物：目标描述符文本与磁盘转换计划
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub name: String,
    pub xml: String,
    pub disks: Vec<PlannedDisk>,
}

/// 域构建器
pub struct DomainBuilder<'a> {
    doc: &'a VmxDocument,
    datastores: &'a DatastoreMap,
    networks: &'a NetworkMap,
    mode: DiskMode,
    format: ImageFormat,
    vmx_dir: Option<PathBuf>,
    nvram_dir: Option<PathBuf>,
    fallback_name: Option<String>,
}

impl<'a> DomainBuilder<'a> {
    pub fn new(
        doc: &'a VmxDocument,
        datastores: &'a DatastoreMap,
        networks: &'a NetworkMap,
    ) -> Self {
        Self {
            doc,
            datastores,
            networks,
            mode: DiskMode::default(),
            format: ImageFormat::default(),
            vmx_dir: None,
            nvram_dir: None,
            fallback_name: None,
        }
    }

    pub fn with_mode(mut self, mode: DiskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// 源描述符所在目录，用于归一化相对磁盘引用
    pub fn with_vmx_dir(mut self, dir: PathBuf) -> Self {
        self.vmx_dir = Some(dir);
        self
    }

    /// EFI 变量文件的放置目录（一般为输出描述符所在目录）
    pub fn with_nvram_dir(mut self, dir: PathBuf) -> Self {
        self.nvram_dir = Some(dir);
        self
    }

    /// displayname 缺失时的回退域名（一般取源文件名）
    pub fn with_fallback_name(mut self, name: String) -> Self {
        self.fallback_name = Some(name);
        self
    }

    /// 合成目标描述符
    ///
    /// 任何磁盘映射失败都会在产出任何内容之前返回错误。
    pub fn build(&self) -> Result<TargetDescriptor> {
        let name = self
            .doc
            .display_name()
            .map(str::to_string)
            .or_else(|| self.fallback_name.clone())
            .ok_or(DomainError::MissingName)?;

        let memory = self.doc.memory_mb().unwrap_or_else(|| {
            warn!("源描述符缺少 memsize，按 1024 MiB 处理");
            1024
        });
        let vcpus = self.doc.num_vcpus().unwrap_or(1);

        let (disks, controllers, planned) = self.build_disks()?;
        let interfaces = self.build_interfaces();

        let domain = xml::DomainXml {
            domain_type: "kvm",
            name: name.clone(),
            genid: self
                .doc
                .generation_id()
                .map(|(hi, lo)| genid_to_uuid(hi, lo)),
            memory: xml::Memory {
                unit: "MiB",
                value: memory,
            },
            vcpu: vcpus,
            cpu: xml::Cpu {
                mode: "host-model",
                topology: self.topology(vcpus),
            },
            os: self.build_os(&name),
            features: xml::Features { acpi: (), apic: () },
            clock: xml::Clock {
                offset: "utc",
                timer: vec![xml::Timer {
                    name: "hpet",
                    present: if self.doc.hpet_present() { "yes" } else { "no" },
                }],
            },
            on_poweroff: "destroy",
            on_reboot: "restart",
            on_crash: "destroy",
            devices: xml::Devices {
                disk: disks,
                controller: controllers,
                interface: interfaces,
                sound: self.doc.sound_virtual_dev().map(|dev| xml::Sound {
                    model: sound_model(dev),
                }),
                graphics: xml::Graphics {
                    graphics_type: "vnc",
                    port: "-1",
                    autoport: "yes",
                },
                video: xml::Video {
                    model: xml::Model {
                        model_type: "virtio",
                    },
                },
                channel: xml::Channel {
                    channel_type: "unix",
                    target: xml::ChannelTarget {
                        target_type: "virtio",
                        name: "org.qemu.guest_agent.0",
                    },
                },
                memballoon: xml::Memballoon { model: "virtio" },
            },
        };

        let mut buffer = String::new();
        let mut ser = quick_xml::se::Serializer::new(&mut buffer);
        ser.indent(' ', 2);
        domain.serialize(ser)?;
        buffer.push('\n');

        debug!("域 {} 合成完毕，共 {} 块磁盘", name, planned.len());
        Ok(TargetDescriptor {
            name,
            xml: buffer,
            disks: planned,
        })
    }

    fn topology(&self, vcpus: u32) -> Option<xml::Topology> {
        let cores = self.doc.cores_per_socket()?;
        if cores == 0 || vcpus % cores != 0 {
            warn!("cpuid.corespersocket={} 无法整除 vCPU 数 {}，忽略拓扑", cores, vcpus);
            return None;
        }
        Some(xml::Topology {
            sockets: vcpus / cores,
            cores,
            threads: 1,
        })
    }

    fn build_os(&self, name: &str) -> xml::Os {
        let efi = self.doc.firmware_is_efi();
        xml::Os {
            os_type: xml::OsType {
                arch: "x86_64",
                machine: "q35",
                value: "hvm",
            },
            loader: efi.then(|| xml::Loader {
                readonly: "yes",
                loader_type: "pflash",
                path: OVMF_CODE.to_string(),
            }),
            nvram: match (&self.nvram_dir, efi) {
                (Some(dir), true) => Some(xml::Nvram {
                    template: OVMF_VARS.to_string(),
                    path: dir.join(format!("{name}.nvram")).display().to_string(),
                }),
                _ => None,
            },
            boot: xml::Boot { dev: "hd" },
        }
    }

    /// 把描述符中的相对磁盘引用归一到源目录下
    fn absolutize(&self, reference: &str) -> PathBuf {
        let p = Path::new(reference);
        match (&self.vmx_dir, p.is_relative()) {
            (Some(dir), true) => dir.join(p),
            _ => p.to_path_buf(),
        }
    }

    fn build_disks(
        &self,
    ) -> Result<(Vec<xml::DiskXml>, Vec<xml::ControllerXml>, Vec<PlannedDisk>)> {
        let mut disk_xml = Vec::new();
        let mut planned = Vec::new();
        // (类型, 编号, 型号)，BTreeSet 保证输出顺序确定
        let mut controllers: BTreeSet<(&'static str, u32, Option<&'static str>)> = BTreeSet::new();

        let mut vd_count = 0usize;
        let mut sd_count = 0usize;
        let mut hd_count = 0usize;
        let mut seen_os_disk = false;

        for dev in self.doc.disks() {
            let reference = self.absolutize(&dev.filename);
            let resolution = self.datastores.resolve_disk(&reference)?;

            let (host_path, convert_to) = match &resolution {
                Resolution::PassThrough { host_path } => (host_path.clone(), None),
                Resolution::Mapped {
                    host_path,
                    target_path,
                } => {
                    let convert_to = if dev.is_cdrom() {
                        None
                    } else {
                        self.format
                            .extension()
                            .map(|ext| target_path.with_extension(ext))
                    };
                    (host_path.clone(), convert_to)
                }
                Resolution::Unmapped => unreachable!("resolve_disk 已拦截未映射路径"),
            };

            // 描述符引用转换产物；无转换时引用主机侧可达的源文件
            let source_file = convert_to.as_ref().unwrap_or(&host_path).clone();
            let os_disk = !dev.is_cdrom() && !seen_os_disk;
            if os_disk {
                seen_os_disk = true;
            }

            let (bus, dev_name, address) = if dev.is_cdrom() {
                // 光驱两种模式下都落在 SATA 上，永不转换
                controllers.insert(("sata", 0, None));
                let name = format!("sd{}", dev_suffix(sd_count));
                sd_count += 1;
                ("sata", name, None)
            } else {
                match self.mode {
                    DiskMode::Performance => {
                        let name = format!("vd{}", dev_suffix(vd_count));
                        vd_count += 1;
                        ("virtio", name, None)
                    }
                    DiskMode::Fidelity => self.fidelity_placement(
                        &dev,
                        &mut controllers,
                        &mut sd_count,
                        &mut hd_count,
                    ),
                }
            };

            disk_xml.push(xml::DiskXml {
                disk_type: "file",
                device: if dev.is_cdrom() { "cdrom" } else { "disk" },
                driver: convert_to
                    .as_ref()
                    .and(self.format.driver_type())
                    .map(|t| xml::Driver {
                        name: "qemu",
                        driver_type: t,
                    }),
                source: xml::DiskSource {
                    file: source_file.display().to_string(),
                },
                target: xml::DiskTarget { dev: dev_name, bus },
                readonly: dev.is_cdrom().then_some(()),
                address,
            });

            planned.push(PlannedDisk {
                reference,
                host_path,
                convert_to,
                cdrom: dev.is_cdrom(),
                os_disk,
            });
        }

        let controller_xml = controllers
            .into_iter()
            .map(|(t, index, model)| xml::ControllerXml {
                controller_type: t,
                index,
                model,
            })
            .collect();

        Ok((disk_xml, controller_xml, planned))
    }

    /// 保真模式下单块数据盘的总线落位
    fn fidelity_placement(
        &self,
        dev: &DiskDevice,
        controllers: &mut BTreeSet<(&'static str, u32, Option<&'static str>)>,
        sd_count: &mut usize,
        hd_count: &mut usize,
    ) -> (&'static str, String, Option<xml::Address>) {
        match dev.bus {
            DiskBus::Scsi => {
                controllers.insert(("scsi", dev.controller, Some("virtio-scsi")));
                let name = format!("sd{}", dev_suffix(*sd_count));
                *sd_count += 1;
                (
                    "scsi",
                    name,
                    Some(xml::Address {
                        addr_type: "drive",
                        controller: dev.controller,
                        bus: 0,
                        target: 0,
                        unit: dev.unit,
                    }),
                )
            }
            DiskBus::Sata => {
                controllers.insert(("sata", dev.controller, None));
                let name = format!("sd{}", dev_suffix(*sd_count));
                *sd_count += 1;
                (
                    "sata",
                    name,
                    Some(xml::Address {
                        addr_type: "drive",
                        controller: dev.controller,
                        bus: 0,
                        target: 0,
                        unit: dev.unit,
                    }),
                )
            }
            DiskBus::Ide => {
                controllers.insert(("ide", 0, None));
                let name = format!("hd{}", dev_suffix(*hd_count));
                *hd_count += 1;
                (
                    "ide",
                    name,
                    Some(xml::Address {
                        addr_type: "drive",
                        controller: 0,
                        bus: dev.controller,
                        target: 0,
                        unit: dev.unit,
                    }),
                )
            }
            DiskBus::Nvme => {
                // 目标模式没有文件后备的 NVMe 客户机总线，降级到 virtio-scsi
                warn!(
                    "nvme{}:{} 无法按原总线保留，降级为 virtio-scsi",
                    dev.controller, dev.unit
                );
                controllers.insert(("scsi", dev.controller, Some("virtio-scsi")));
                let name = format!("sd{}", dev_suffix(*sd_count));
                *sd_count += 1;
                ("scsi", name, None)
            }
        }
    }

    fn build_interfaces(&self) -> Vec<xml::InterfaceXml> {
        self.doc
            .ethernets()
            .into_iter()
            .map(|nic| {
                let target = self
                    .networks
                    .resolve(&nic.network_name, &nic.connection_type);
                let (iface_type, source) = match target {
                    NetworkTarget::Network(name) => (
                        "network",
                        xml::IfaceSource {
                            network: Some(name.clone()),
                            bridge: None,
                        },
                    ),
                    NetworkTarget::Bridge(name) => (
                        "bridge",
                        xml::IfaceSource {
                            network: None,
                            bridge: Some(name.clone()),
                        },
                    ),
                };
                let model = match self.mode {
                    DiskMode::Performance => "virtio",
                    DiskMode::Fidelity => nic_model(&nic.virtual_dev),
                };
                xml::InterfaceXml {
                    iface_type,
                    mac: nic.mac.map(|address| xml::Mac { address }),
                    source,
                    model: xml::Model { model_type: model },
                }
            })
            .collect()
    }
}

/// 源端网卡型号到目标型号的映射；vmxnet3 没有对应仿真，落到 virtio
fn nic_model(virtual_dev: &str) -> &'static str {
    match virtual_dev.to_lowercase().as_str() {
        "e1000" => "e1000",
        "e1000e" => "e1000e",
        _ => "virtio",
    }
}

fn sound_model(virtual_dev: &str) -> &'static str {
    match virtual_dev.to_lowercase().as_str() {
        "es1371" => "es1370",
        "sb16" => "sb16",
        _ => "ich9",
    }
}

/// 世代标识：两个带符号 64 位整数拼成 GUID
fn genid_to_uuid(hi: i64, lo: i64) -> String {
    let value = ((hi as u64 as u128) << 64) | (lo as u64 as u128);
    uuid::Uuid::from_u128(value).to_string()
}

/// 块设备名后缀：a..z，之后 aa、ab……
fn dev_suffix(index: usize) -> String {
    if index < 26 {
        ((b'a' + index as u8) as char).to_string()
    } else {
        let first = (b'a' + (index / 26 - 1) as u8) as char;
        let second = (b'a' + (index % 26) as u8) as char;
        format!("{first}{second}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_suffix() {
        assert_eq!(dev_suffix(0), "a");
        assert_eq!(dev_suffix(25), "z");
        assert_eq!(dev_suffix(26), "aa");
        assert_eq!(dev_suffix(27), "ab");
    }

    #[test]
    fn test_genid_to_uuid_stable() {
        let a = genid_to_uuid(5106784185605983626, -7663733613895827237);
        let b = genid_to_uuid(5106784185605983626, -7663733613895827237);
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_nic_model_mapping() {
        assert_eq!(nic_model("e1000e"), "e1000e");
        assert_eq!(nic_model("vmxnet3"), "virtio");
        assert_eq!(nic_model(""), "virtio");
    }
}
