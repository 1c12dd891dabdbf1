//! libvirt 域描述符的序列化模型
//!
//! 字段顺序即输出顺序，serde 结构体保证同样输入产生逐字节相同的 XML。

use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename = "domain")]
pub struct DomainXml {
    #[serde(rename = "@type")]
    pub domain_type: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genid: Option<String>,
    pub memory: Memory,
    pub vcpu: u32,
    pub cpu: Cpu,
    pub os: Os,
    pub features: Features,
    pub clock: Clock,
    pub on_poweroff: &'static str,
    pub on_reboot: &'static str,
    pub on_crash: &'static str,
    pub devices: Devices,
}

#[derive(Debug, Serialize)]
pub struct Memory {
    #[serde(rename = "@unit")]
    pub unit: &'static str,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Serialize)]
pub struct Cpu {
    #[serde(rename = "@mode")]
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
}

#[derive(Debug, Serialize)]
pub struct Topology {
    #[serde(rename = "@sockets")]
    pub sockets: u32,
    #[serde(rename = "@cores")]
    pub cores: u32,
    #[serde(rename = "@threads")]
    pub threads: u32,
}

#[derive(Debug, Serialize)]
pub struct Os {
    #[serde(rename = "type")]
    pub os_type: OsType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<Loader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvram: Option<Nvram>,
    pub boot: Boot,
}

#[derive(Debug, Serialize)]
pub struct OsType {
    #[serde(rename = "@arch")]
    pub arch: &'static str,
    #[serde(rename = "@machine")]
    pub machine: &'static str,
    #[serde(rename = "$text")]
    pub value: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Loader {
    #[serde(rename = "@readonly")]
    pub readonly: &'static str,
    #[serde(rename = "@type")]
    pub loader_type: &'static str,
    #[serde(rename = "$text")]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct Nvram {
    #[serde(rename = "@template")]
    pub template: String,
    #[serde(rename = "$text")]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct Boot {
    #[serde(rename = "@dev")]
    pub dev: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Features {
    pub acpi: (),
    pub apic: (),
}

#[derive(Debug, Serialize)]
pub struct Clock {
    #[serde(rename = "@offset")]
    pub offset: &'static str,
    pub timer: Vec<Timer>,
}

#[derive(Debug, Serialize)]
pub struct Timer {
    #[serde(rename = "@name")]
    pub name: &'static str,
    #[serde(rename = "@present")]
    pub present: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Devices {
    pub disk: Vec<DiskXml>,
    pub controller: Vec<ControllerXml>,
    pub interface: Vec<InterfaceXml>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<Sound>,
    pub graphics: Graphics,
    pub video: Video,
    pub channel: Channel,
    pub memballoon: Memballoon,
}

#[derive(Debug, Serialize)]
pub struct DiskXml {
    #[serde(rename = "@type")]
    pub disk_type: &'static str,
    #[serde(rename = "@device")]
    pub device: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<Driver>,
    pub source: DiskSource,
    pub target: DiskTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<()>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Debug, Serialize)]
pub struct Driver {
    #[serde(rename = "@name")]
    pub name: &'static str,
    #[serde(rename = "@type")]
    pub driver_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiskSource {
    #[serde(rename = "@file")]
    pub file: String,
}

#[derive(Debug, Serialize)]
pub struct DiskTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus")]
    pub bus: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Address {
    #[serde(rename = "@type")]
    pub addr_type: &'static str,
    #[serde(rename = "@controller")]
    pub controller: u32,
    #[serde(rename = "@bus")]
    pub bus: u32,
    #[serde(rename = "@target")]
    pub target: u32,
    #[serde(rename = "@unit")]
    pub unit: u32,
}

#[derive(Debug, Serialize)]
pub struct ControllerXml {
    #[serde(rename = "@type")]
    pub controller_type: &'static str,
    #[serde(rename = "@index")]
    pub index: u32,
    #[serde(rename = "@model", skip_serializing_if = "Option::is_none")]
    pub model: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct InterfaceXml {
    #[serde(rename = "@type")]
    pub iface_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<Mac>,
    pub source: IfaceSource,
    pub model: Model,
}

#[derive(Debug, Serialize)]
pub struct Mac {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct IfaceSource {
    #[serde(rename = "@network", skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(rename = "@bridge", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Model {
    #[serde(rename = "@type")]
    pub model_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Sound {
    #[serde(rename = "@model")]
    pub model: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Graphics {
    #[serde(rename = "@type")]
    pub graphics_type: &'static str,
    #[serde(rename = "@port")]
    pub port: &'static str,
    #[serde(rename = "@autoport")]
    pub autoport: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Video {
    pub model: Model,
}

/// 客户机代理通道，启动验证的就绪探测依赖它
#[derive(Debug, Serialize)]
pub struct Channel {
    #[serde(rename = "@type")]
    pub channel_type: &'static str,
    pub target: ChannelTarget,
}

#[derive(Debug, Serialize)]
pub struct ChannelTarget {
    #[serde(rename = "@type")]
    pub target_type: &'static str,
    #[serde(rename = "@name")]
    pub name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Memballoon {
    #[serde(rename = "@model")]
    pub model: &'static str,
}
