//! 可插拔就绪探测
//!
//! 就绪的判据有两派：客户机代理握手（确证系统起来了）和
//! 被动等待（只确认实例没有死掉）。两派各有道理，由调用方
//! 按客户机是否装有代理来选择，这里不偏袒哪个是"正确"默认。

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use virt::domain::Domain;

/// 就绪探测能力：在超时内等待客户机的就绪信号
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// 返回是否在超时前观测到就绪
    async fn wait_ready(&self, domain: &Domain, timeout: Duration) -> bool;

    fn name(&self) -> &'static str;
}

/// 探测方式选择（CLI 层）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Agent,
    Passive,
}

impl ProbeKind {
    pub fn build(self) -> Box<dyn ReadinessProbe> {
        match self {
            ProbeKind::Agent => Box::new(AgentProbe::default()),
            ProbeKind::Passive => Box::new(PassiveProbe),
        }
    }
}

impl std::str::FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(ProbeKind::Agent),
            "passive" => Ok(ProbeKind::Passive),
            other => Err(format!("未知探测方式: {other:?}")),
        }
    }
}

/// 客户机代理握手探测
///
/// 周期性通过 libvirt 的代理通道发 guest-ping，第一声应答即就绪。
pub struct AgentProbe {
    interval: Duration,
}

impl Default for AgentProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

impl AgentProbe {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    fn ping(domain: &Domain) -> bool {
        let cmd = serde_json::json!({ "execute": "guest-ping" }).to_string();
        match domain.qemu_agent_command(&cmd, 5, 0) {
            Ok(_) => true,
            Err(e) => {
                debug!("guest-ping 未应答: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for AgentProbe {
    async fn wait_ready(&self, domain: &Domain, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if Self::ping(domain) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// 被动等待探测
///
/// 睡满超时后看实例是否还在运行：崩溃或自行关机判失败，
/// 仍在运行就当作引导成功。分不出"卡死"和"慢"，是它的局限。
pub struct PassiveProbe;

#[async_trait]
impl ReadinessProbe for PassiveProbe {
    async fn wait_ready(&self, domain: &Domain, timeout: Duration) -> bool {
        tokio::time::sleep(timeout).await;
        domain.is_active().unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "passive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_kind_parse() {
        assert_eq!("agent".parse::<ProbeKind>().unwrap(), ProbeKind::Agent);
        assert_eq!("Passive".parse::<ProbeKind>().unwrap(), ProbeKind::Passive);
        assert!("telepathy".parse::<ProbeKind>().is_err());
    }

    #[test]
    fn test_probe_names() {
        assert_eq!(ProbeKind::Agent.build().name(), "agent");
        assert_eq!(ProbeKind::Passive.build().name(), "passive");
    }
}
