//! 数据存储路径重写
//!
//! 每条规则是 `{引用前缀, 挂载前缀, 目标前缀}` 三元组：
//! 引用前缀是路径在源描述符里的写法，挂载前缀是该存储在
//! 转换主机上的实际可达位置，目标前缀是目的命名空间。
//! 规则按配置顺序匹配，首个命中者独自决定重写结果，
//! 没有"最长前缀"之类的启发式。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{MapperError, Result};

/// 一条有序映射规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    /// 路径在源描述符中出现的前缀
    pub reference_prefix: PathBuf,

    /// 该存储在转换主机上的挂载位置
    pub mounted_prefix: PathBuf,

    /// 目标命名空间前缀；`None` 为直通规则，
    /// 其下的文件只换挂载位置、不做格式转换
    pub target_prefix: Option<PathBuf>,
}

impl MappingRule {
    pub fn new(
        reference_prefix: impl Into<PathBuf>,
        mounted_prefix: impl Into<PathBuf>,
        target_prefix: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reference_prefix: reference_prefix.into(),
            mounted_prefix: mounted_prefix.into(),
            target_prefix: Some(target_prefix.into()),
        }
    }

    /// 直通规则（可移动介质、共享 ISO 目录等）
    pub fn pass_through(
        reference_prefix: impl Into<PathBuf>,
        mounted_prefix: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reference_prefix: reference_prefix.into(),
            mounted_prefix: mounted_prefix.into(),
            target_prefix: None,
        }
    }

    /// 解析命令行书写形式 `REF,MOUNTED[,TARGET]`
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        match parts.as_slice() {
            [r, m] if !r.is_empty() && !m.is_empty() => Ok(Self::pass_through(*r, *m)),
            [r, m, t] if !r.is_empty() && !m.is_empty() && !t.is_empty() => {
                Ok(Self::new(*r, *m, *t))
            }
            _ => Err(MapperError::InvalidRule(format!(
                "期望 REF,MOUNTED[,TARGET]，得到 {s:?}"
            ))),
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.target_prefix.is_none()
    }

    /// 按路径分量判断前缀命中（`/a/b` 命中 `/a/b/c`，不命中 `/a/bc`）。
    /// 引用前缀和挂载前缀都算命中：描述符里的相对引用会先归一到
    /// 源文件所在目录，也就是挂载命名空间下的路径。
    fn strip<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.reference_prefix)
            .or_else(|_| path.strip_prefix(&self.mounted_prefix))
            .ok()
    }
}

/// 一次解析的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 命中普通规则：主机本地路径 + 目标路径
    Mapped {
        host_path: PathBuf,
        target_path: PathBuf,
    },
    /// 命中直通规则：只有主机本地路径，不安排转换
    PassThrough { host_path: PathBuf },
    /// 无规则命中
    Unmapped,
}

/// 一个任务的数据存储映射表，构造后不可变
#[derive(Debug, Clone, Default)]
pub struct DatastoreMap {
    rules: Vec<MappingRule>,
}

impl DatastoreMap {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 按规则顺序解析一个源路径，首个前缀命中者生效
    pub fn resolve(&self, path: &Path) -> Resolution {
        for rule in &self.rules {
            let Some(rest) = rule.strip(path) else {
                continue;
            };
            let host_path = rule.mounted_prefix.join(rest);
            return match &rule.target_prefix {
                Some(target) => {
                    let target_path = target.join(rest);
                    debug!("{} => {} (目标 {})", path.display(), host_path.display(), target_path.display());
                    Resolution::Mapped {
                        host_path,
                        target_path,
                    }
                }
                None => {
                    debug!("{} => {} (直通)", path.display(), host_path.display());
                    Resolution::PassThrough { host_path }
                }
            };
        }
        Resolution::Unmapped
    }

    /// 解析磁盘引用，未命中任何规则即失败
    pub fn resolve_disk(&self, path: &Path) -> Result<Resolution> {
        match self.resolve(path) {
            Resolution::Unmapped => Err(MapperError::UnmappedPath {
                path: path.to_path_buf(),
            }),
            r => Ok(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> DatastoreMap {
        DatastoreMap::new(vec![
            MappingRule::new("/vmfs/volumes/datastore1", "/mnt/ds1", "/kvm/ds1"),
            MappingRule::pass_through("/vmfs/volumes/isos", "/mnt/isos"),
            MappingRule::new("/vmfs/volumes", "/mnt/other", "/kvm/other"),
        ])
    }

    #[test]
    fn test_first_match_wins() {
        // datastore1 前缀先命中第一条，不会落到兜底的 /vmfs/volumes
        let r = rules().resolve(Path::new("/vmfs/volumes/datastore1/vm1/vm1.vmdk"));
        assert_eq!(
            r,
            Resolution::Mapped {
                host_path: PathBuf::from("/mnt/ds1/vm1/vm1.vmdk"),
                target_path: PathBuf::from("/kvm/ds1/vm1/vm1.vmdk"),
            }
        );
    }

    #[test]
    fn test_rule_order_significant() {
        // 宽前缀放在首位时抢走所有匹配
        let m = DatastoreMap::new(vec![
            MappingRule::new("/vmfs/volumes", "/mnt/other", "/kvm/other"),
            MappingRule::new("/vmfs/volumes/datastore1", "/mnt/ds1", "/kvm/ds1"),
        ]);
        let r = m.resolve(Path::new("/vmfs/volumes/datastore1/vm1/vm1.vmdk"));
        assert_eq!(
            r,
            Resolution::Mapped {
                host_path: PathBuf::from("/mnt/other/datastore1/vm1/vm1.vmdk"),
                target_path: PathBuf::from("/kvm/other/datastore1/vm1/vm1.vmdk"),
            }
        );
    }

    #[test]
    fn test_non_matching_rule_order_irrelevant() {
        let a = rules().resolve(Path::new("/vmfs/volumes/isos/sle.iso"));
        let m = DatastoreMap::new(vec![
            MappingRule::pass_through("/vmfs/volumes/isos", "/mnt/isos"),
            MappingRule::new("/vmfs/volumes/datastore1", "/mnt/ds1", "/kvm/ds1"),
            MappingRule::new("/vmfs/volumes", "/mnt/other", "/kvm/other"),
        ]);
        let b = m.resolve(Path::new("/vmfs/volumes/isos/sle.iso"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_pass_through_identity() {
        let r = rules().resolve(Path::new("/vmfs/volumes/isos/sle.iso"));
        assert_eq!(
            r,
            Resolution::PassThrough {
                host_path: PathBuf::from("/mnt/isos/sle.iso"),
            }
        );
    }

    #[test]
    fn test_component_aware_prefix() {
        // /vmfs/volumes/datastore1 不能命中 /vmfs/volumes/datastore12
        let r = rules().resolve(Path::new("/vmfs/volumes/datastore12/vm/vm.vmdk"));
        assert_eq!(
            r,
            Resolution::Mapped {
                host_path: PathBuf::from("/mnt/other/datastore12/vm/vm.vmdk"),
                target_path: PathBuf::from("/kvm/other/datastore12/vm/vm.vmdk"),
            }
        );
    }

    #[test]
    fn test_unmapped_disk_is_error() {
        let err = rules()
            .resolve_disk(Path::new("/nfs/elsewhere/vm.vmdk"))
            .unwrap_err();
        assert!(matches!(err, MapperError::UnmappedPath { .. }));
    }

    #[test]
    fn test_parse_rule_forms() {
        let full = MappingRule::parse("/vmfs/volumes/ds1,/mnt/ds1,/kvm/ds1").unwrap();
        assert!(!full.is_pass_through());
        let pt = MappingRule::parse("/vmfs/volumes/isos,/mnt/isos").unwrap();
        assert!(pt.is_pass_through());
        assert!(MappingRule::parse("justone").is_err());
        assert!(MappingRule::parse(",,").is_err());
    }

    #[test]
    fn test_mounted_prefix_also_matches() {
        // 归一后的相对引用落在挂载命名空间下，同一条规则照样命中
        let r = rules().resolve(Path::new("/mnt/ds1/vm1/vm1.vmdk"));
        assert_eq!(
            r,
            Resolution::Mapped {
                host_path: PathBuf::from("/mnt/ds1/vm1/vm1.vmdk"),
                target_path: PathBuf::from("/kvm/ds1/vm1/vm1.vmdk"),
            }
        );
    }

    #[test]
    fn test_target_path_extension_swap() {
        // 端到端场景的映射部分：扩展名替换由调用方完成
        let m = DatastoreMap::new(vec![MappingRule::new(
            "/vmfs/volumes/datastore1",
            "/src",
            "/dst",
        )]);
        let Resolution::Mapped { target_path, .. } = m
            .resolve_disk(Path::new("/vmfs/volumes/datastore1/vm1/vm1.vmdk"))
            .unwrap()
        else {
            panic!("应命中普通规则");
        };
        assert_eq!(target_path.with_extension("qcow2"), PathBuf::from("/dst/vm1/vm1.qcow2"));
        assert_eq!(target_path.with_extension("xml"), PathBuf::from("/dst/vm1/vm1.xml"));
    }
}
