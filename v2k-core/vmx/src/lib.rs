//! V2K 源描述符解析
//!
//! VMX 是行式、大小写不敏感的 `key = "value"` 文本格式，
//! 键内编码设备坐标（总线、控制器号、单元号），
//! 例如 `scsi0:1.filename`。解析结果是保序的结构化文档，
//! 供域构建器按设备坐标读取。解析是纯函数，无副作用。

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

mod device;

pub use device::{DiskBus, DiskDevice, EthernetDevice};

#[derive(Error, Debug)]
pub enum VmxError {
    #[error("第 {line_no} 行格式错误（缺少 '='）: {line}")]
    Malformed { line_no: usize, line: String },

    #[error("第 {line_no} 行引号未闭合: {line}")]
    UnterminatedQuote { line_no: usize, line: String },

    #[error("键 {key} 重复定义且取值冲突: {old:?} != {new:?}")]
    DuplicateKey {
        key: String,
        old: String,
        new: String,
    },

    #[error("读取描述符失败: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmxError>;

/// 解析后的源描述符
///
/// 键统一小写存储（格式大小写不敏感），并保留首次出现的顺序，
/// 保证设备枚举与输出的确定性。
#[derive(Debug, Clone, Default)]
pub struct VmxDocument {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl VmxDocument {
    /// 解析描述符文本
    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = VmxDocument::default();

        for (i, raw) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some(eq) = line.find('=') else {
                return Err(VmxError::Malformed {
                    line_no,
                    line: line.to_string(),
                });
            };
            let key = line[..eq].trim().to_lowercase();
            let value = parse_value(line[eq + 1..].trim(), line_no, line)?;
            if key.is_empty() {
                return Err(VmxError::Malformed {
                    line_no,
                    line: line.to_string(),
                });
            }
            doc.insert(key, value)?;
        }

        debug!("解析到 {} 个键", doc.entries.len());
        Ok(doc)
    }

    /// 从文件加载并解析
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    fn insert(&mut self, key: String, value: String) -> Result<()> {
        if let Some(&i) = self.index.get(&key) {
            let old = &self.entries[i].1;
            if *old != value {
                return Err(VmxError::DuplicateKey {
                    key,
                    old: old.clone(),
                    new: value,
                });
            }
            return Ok(());
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        Ok(())
    }

    /// 按键查询（大小写不敏感）
    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(&key.to_lowercase())
            .map(|&i| self.entries[i].1.as_str())
    }

    /// 字符串取值，缺失时返回空串
    pub fn get_str(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    /// 布尔取值："true"（任意大小写）为真，其余一律为假
    pub fn get_bool(&self, key: &str) -> bool {
        self.get_str(key).eq_ignore_ascii_case("true")
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// 按设备坐标取属性，键形如 `{bus}{controller}:{unit}.{attribute}`
    pub fn device_attr(&self, bus: DiskBus, controller: u32, unit: u32, attr: &str) -> &str {
        self.get_str(&format!("{}{}:{}.{}", bus.as_str(), controller, unit, attr))
    }

    /// 保序遍历全部键值
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // --- 虚拟机级标量属性 ---

    pub fn display_name(&self) -> Option<&str> {
        self.get("displayname").filter(|s| !s.is_empty())
    }

    /// 内存大小（MiB）
    pub fn memory_mb(&self) -> Option<u64> {
        self.get_u64("memsize")
    }

    pub fn num_vcpus(&self) -> Option<u32> {
        self.get("numvcpus").and_then(|v| v.parse().ok())
    }

    pub fn cores_per_socket(&self) -> Option<u32> {
        self.get("cpuid.corespersocket").and_then(|v| v.parse().ok())
    }

    /// 固件为 UEFI（`firmware = "efi"`），否则按 BIOS 处理
    pub fn firmware_is_efi(&self) -> bool {
        self.get_str("firmware").eq_ignore_ascii_case("efi")
    }

    pub fn nvram(&self) -> Option<&str> {
        self.get("nvram").filter(|s| !s.is_empty())
    }

    pub fn guest_os(&self) -> Option<&str> {
        self.get("guestos").filter(|s| !s.is_empty())
    }

    /// 虚拟机世代标识（vm.genid / vm.genidx），两个带符号 64 位整数
    pub fn generation_id(&self) -> Option<(i64, i64)> {
        let hi = self.get_i64("vm.genid")?;
        let lo = self.get_i64("vm.genidx")?;
        Some((hi, lo))
    }

    pub fn hpet_present(&self) -> bool {
        self.get_bool("hpet0.present")
    }

    pub fn sound_virtual_dev(&self) -> Option<&str> {
        self.get("sound.virtualdev").filter(|s| !s.is_empty())
    }

    /// 按总线→控制器→单元的确定顺序枚举所有在位磁盘设备
    pub fn disks(&self) -> Vec<DiskDevice> {
        device::enumerate_disks(self)
    }

    /// 枚举所有在位网卡
    pub fn ethernets(&self) -> Vec<EthernetDevice> {
        device::enumerate_ethernets(self)
    }
}

fn parse_value(raw: &str, line_no: usize, line: &str) -> Result<String> {
    if let Some(rest) = raw.strip_prefix('"') {
        let Some(inner) = rest.strip_suffix('"') else {
            return Err(VmxError::UnterminatedQuote {
                line_no,
                line: line.to_string(),
            });
        };
        return Ok(inner.to_string());
    }
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let doc = VmxDocument::parse("displayName = \"vm1\"\nmemSize = \"4096\"\n").unwrap();
        assert_eq!(doc.display_name(), Some("vm1"));
        assert_eq!(doc.memory_mb(), Some(4096));
    }

    #[test]
    fn test_keys_case_insensitive() {
        let doc = VmxDocument::parse("DisplayName = \"a\"").unwrap();
        assert_eq!(doc.get("displayname"), Some("a"));
        assert_eq!(doc.get("DISPLAYNAME"), Some("a"));
    }

    #[test]
    fn test_comments_and_blank_ignored() {
        let doc = VmxDocument::parse("# comment\n!directive\n\nmemsize = \"1\"\n").unwrap();
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_unquoted_value() {
        let doc = VmxDocument::parse("numvcpus = 4").unwrap();
        assert_eq!(doc.num_vcpus(), Some(4));
    }

    #[test]
    fn test_malformed_line() {
        let err = VmxDocument::parse("this line has no equals").unwrap_err();
        assert!(matches!(err, VmxError::Malformed { line_no: 1, .. }));
    }

    #[test]
    fn test_unterminated_quote() {
        let err = VmxDocument::parse("displayname = \"oops").unwrap_err();
        assert!(matches!(err, VmxError::UnterminatedQuote { .. }));
    }

    #[test]
    fn test_duplicate_same_value_tolerated() {
        let doc = VmxDocument::parse("a = \"1\"\nA = \"1\"\n").unwrap();
        assert_eq!(doc.get("a"), Some("1"));
    }

    #[test]
    fn test_duplicate_conflicting_value_rejected() {
        let err = VmxDocument::parse("a = \"1\"\na = \"2\"\n").unwrap_err();
        assert!(matches!(err, VmxError::DuplicateKey { .. }));
    }

    #[test]
    fn test_bool_semantics() {
        let doc = VmxDocument::parse("x = \"TRUE\"\ny = \"yes\"\nz = \"false\"\n").unwrap();
        assert!(doc.get_bool("x"));
        assert!(!doc.get_bool("y"));
        assert!(!doc.get_bool("z"));
        assert!(!doc.get_bool("missing"));
    }

    #[test]
    fn test_generation_id() {
        let doc =
            VmxDocument::parse("vm.genid = \"-8536691797830887966\"\nvm.genidx = \"123\"\n")
                .unwrap();
        assert_eq!(doc.generation_id(), Some((-8536691797830887966, 123)));
    }

    #[test]
    fn test_order_preserved() {
        let doc = VmxDocument::parse("b = \"1\"\na = \"2\"\nc = \"3\"\n").unwrap();
        let keys: Vec<&str> = doc.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }
}
