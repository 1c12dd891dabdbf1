//! 虚拟网络重写
//!
//! 与磁盘不同，网络解析失败不致命：缺网卡的机器迁移后还能补救，
//! 缺磁盘的不能。未命中任何规则时降级到配置的默认网络并告警。

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{MapperError, Result};

/// 目标侧网络连接方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTarget {
    /// libvirt 命名网络
    Network(String),
    /// 宿主机网桥
    Bridge(String),
}

impl NetworkTarget {
    /// 解析书写形式 `net:<名称>` 或 `bridge:<名称>`
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("net:") {
            if !name.is_empty() {
                return Ok(NetworkTarget::Network(name.to_string()));
            }
        }
        if let Some(name) = s.strip_prefix("bridge:") {
            if !name.is_empty() {
                return Ok(NetworkTarget::Bridge(name.to_string()));
            }
        }
        Err(MapperError::InvalidRule(format!(
            "期望 net:<名称> 或 bridge:<名称>，得到 {s:?}"
        )))
    }
}

/// 一条网络匹配规则：按名称或按连接类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub match_name: Option<String>,
    pub match_type: Option<String>,
    pub target: NetworkTarget,
}

impl NetworkRule {
    pub fn by_name(name: impl Into<String>, target: NetworkTarget) -> Self {
        Self {
            match_name: Some(name.into()),
            match_type: None,
            target,
        }
    }

    pub fn by_type(conn_type: impl Into<String>, target: NetworkTarget) -> Self {
        Self {
            match_name: None,
            match_type: Some(conn_type.into()),
            target,
        }
    }

    /// 解析命令行书写形式 `name:<源名称>=<目标>` 或 `type:<连接类型>=<目标>`
    pub fn parse(s: &str) -> Result<Self> {
        let Some((matcher, target)) = s.split_once('=') else {
            return Err(MapperError::InvalidRule(format!(
                "期望 MATCH=TARGET，得到 {s:?}"
            )));
        };
        let target = NetworkTarget::parse(target)?;
        if let Some(name) = matcher.strip_prefix("name:") {
            if !name.is_empty() {
                return Ok(Self::by_name(name, target));
            }
        }
        if let Some(t) = matcher.strip_prefix("type:") {
            if !t.is_empty() {
                return Ok(Self::by_type(t, target));
            }
        }
        Err(MapperError::InvalidRule(format!(
            "期望 name:<名称> 或 type:<类型> 作为匹配端，得到 {matcher:?}"
        )))
    }
}

/// 一个任务的网络映射表
#[derive(Debug, Clone)]
pub struct NetworkMap {
    rules: Vec<NetworkRule>,
    default: NetworkTarget,
}

impl Default for NetworkMap {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: NetworkTarget::Network("default".to_string()),
        }
    }
}

impl NetworkMap {
    pub fn new(rules: Vec<NetworkRule>, default: NetworkTarget) -> Self {
        Self { rules, default }
    }

    pub fn default_target(&self) -> &NetworkTarget {
        &self.default
    }

    /// 先按名称字面匹配（大小写不敏感），再按连接类型，最后兜底默认网络
    pub fn resolve(&self, name: &str, conn_type: &str) -> &NetworkTarget {
        if !name.is_empty() {
            for rule in &self.rules {
                if let Some(n) = &rule.match_name {
                    if n.eq_ignore_ascii_case(name) {
                        return &rule.target;
                    }
                }
            }
        }
        if !conn_type.is_empty() {
            for rule in &self.rules {
                if let Some(t) = &rule.match_type {
                    if t.eq_ignore_ascii_case(conn_type) {
                        return &rule.target;
                    }
                }
            }
        }
        warn!(
            "网络 {:?} (连接类型 {:?}) 未命中任何规则，降级到默认网络",
            name, conn_type
        );
        &self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> NetworkMap {
        NetworkMap::new(
            vec![
                NetworkRule::by_name("VM Network", NetworkTarget::Bridge("br0".to_string())),
                NetworkRule::by_type("nat", NetworkTarget::Network("default".to_string())),
                NetworkRule::by_name("dmz-net", NetworkTarget::Network("dmz".to_string())),
            ],
            NetworkTarget::Network("fallback".to_string()),
        )
    }

    #[test]
    fn test_name_match_first() {
        let m = map();
        assert_eq!(
            m.resolve("VM Network", "nat"),
            &NetworkTarget::Bridge("br0".to_string())
        );
    }

    #[test]
    fn test_name_match_case_insensitive() {
        let m = map();
        assert_eq!(
            m.resolve("vm network", ""),
            &NetworkTarget::Bridge("br0".to_string())
        );
    }

    #[test]
    fn test_type_match_second() {
        let m = map();
        assert_eq!(
            m.resolve("unknown-net", "nat"),
            &NetworkTarget::Network("default".to_string())
        );
    }

    #[test]
    fn test_fallback_is_not_fatal() {
        let m = map();
        assert_eq!(
            m.resolve("unknown-net", "bridged"),
            &NetworkTarget::Network("fallback".to_string())
        );
    }

    #[test]
    fn test_parse_rules() {
        let r = NetworkRule::parse("name:VM Network=bridge:br0").unwrap();
        assert_eq!(r.match_name.as_deref(), Some("VM Network"));
        assert_eq!(r.target, NetworkTarget::Bridge("br0".to_string()));

        let r = NetworkRule::parse("type:bridged=net:prod").unwrap();
        assert_eq!(r.match_type.as_deref(), Some("bridged"));

        assert!(NetworkRule::parse("noequals").is_err());
        assert!(NetworkRule::parse("name:=net:x").is_err());
        assert!(NetworkRule::parse("name:a=gibberish").is_err());
    }
}
