//! V2K 启动验证
//!
//! 把目标描述符注册成一个瞬态实例，限时引导测试，然后无条件
//! 收回。状态机：
//!
//! ```text
//! Defined → Started → Probing → {Success, BootFailure, ScriptFailure} → TornDown
//! ```
//!
//! 定义/启动失败立即判 ScriptFailure；超时内观测到就绪信号判
//! Success，超时未观测判 BootFailure。无论哪条路径退出（包括
//! panic），瞬态实例都恰好被销毁并注销一次——除非显式要求留下
//! 现场调试。

mod probe;

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;

pub use probe::{AgentProbe, PassiveProbe, ProbeKind, ReadinessProbe};
pub use v2k_common::BootTestOutcome;

/// 隔离测试网络的约定名称，须在宿主机上预先定义
pub const ISOLATED_NETWORK: &str = "v2k-isolated";

#[derive(Error, Debug)]
pub enum BootTestError {
    #[error("读取描述符失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("描述符缺少 <name> 元素")]
    MissingName,

    #[error("连接 libvirt 失败: {0}")]
    Connect(String),

    #[error("定义瞬态实例失败: {0}")]
    Define(String),

    #[error("启动瞬态实例失败: {0}")]
    Start(String),
}

pub type Result<T> = std::result::Result<T, BootTestError>;

/// 瞬态实例回收卫兵
///
/// `Drop` 兜底保证任何退出路径（含 panic）都会回收；
/// `take()` 语义保证销毁与注销最多执行一次。
struct TransientGuard {
    domain: Domain,
    name: String,
    keep: bool,
    done: bool,
}

impl TransientGuard {
    fn new(domain: Domain, name: String, keep: bool) -> Self {
        Self {
            domain,
            name,
            keep,
            done: false,
        }
    }

    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn teardown(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.keep {
            warn!("按要求保留瞬态实例 {} 以便调试", self.name);
            return;
        }
        // 未在运行的实例 destroy 会报错，忽略即可
        let _ = self.domain.destroy();
        if let Err(e) = self.domain.undefine() {
            error!("注销瞬态实例 {} 失败: {}", self.name, e);
        } else {
            info!("瞬态实例 {} 已回收", self.name);
        }
    }
}

impl Drop for TransientGuard {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// 启动验证器
pub struct BootValidator {
    uri: String,
    timeout: Duration,
    probe: Box<dyn ReadinessProbe>,
    isolated: bool,
    keep: bool,
}

impl BootValidator {
    pub fn new() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            timeout: Duration::from_secs(60),
            probe: Box::new(AgentProbe::default()),
            isolated: false,
            keep: false,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 在隔离网络上测试，避免测试实例对生产网段产生副作用
    pub fn with_isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    /// 显式要求保留实例现场，抑制回收
    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// 引导测试一个目标描述符文件
    ///
    /// 一切环境/管理层错误折叠成 `ScriptFailure`，与客户机自身
    /// 引导失败（`BootFailure`）严格区分。
    pub async fn validate(&self, xml_path: &Path) -> BootTestOutcome {
        match self.run(xml_path).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("{}", err);
                BootTestOutcome::ScriptFailure
            }
        }
    }

    async fn run(&self, xml_path: &Path) -> Result<BootTestOutcome> {
        let xml = tokio::fs::read_to_string(xml_path).await?;
        let original_name = extract_name(&xml).ok_or(BootTestError::MissingName)?;
        let test_name = transient_name(&original_name);

        let mut xml = rewrite_name(&xml, &test_name);
        if self.isolated {
            xml = rewrite_isolated(&xml, ISOLATED_NETWORK);
        }

        let conn =
            Connect::open(Some(&self.uri)).map_err(|e| BootTestError::Connect(e.to_string()))?;

        // Defined
        let domain = Domain::define_xml(&conn, &xml)
            .map_err(|e| BootTestError::Define(e.to_string()))?;
        info!("瞬态实例 {} 已定义", test_name);
        let mut guard = TransientGuard::new(domain, test_name.clone(), self.keep);

        // Started
        if let Err(e) = guard.domain().create() {
            // guard 负责注销已定义未启动的实例
            return Err(BootTestError::Start(e.to_string()));
        }
        info!(
            "瞬态实例 {} 已启动，开始 {} 探测（超时 {:?}）",
            test_name,
            self.probe.name(),
            self.timeout
        );

        // Probing
        let ready = self.probe.wait_ready(guard.domain(), self.timeout).await;

        let outcome = if ready {
            info!("{}: 在超时前观测到就绪信号", test_name);
            BootTestOutcome::Success
        } else {
            warn!("{}: 超时未观测到就绪信号", test_name);
            BootTestOutcome::BootFailure
        };

        guard.teardown();
        Ok(outcome)
    }
}

impl Default for BootValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// 瞬态测试实例名：确定性派生，避免与正式定义的域同名。
/// 同名并发测试的互斥由外部调度保证，这里不加随机后缀。
fn transient_name(name: &str) -> String {
    format!("{name}-boottest")
}

fn extract_name(xml: &str) -> Option<String> {
    let re = regex::Regex::new(r"<name>([^<]+)</name>").unwrap();
    re.captures(xml).map(|c| c[1].to_string())
}

fn rewrite_name(xml: &str, new_name: &str) -> String {
    let re = regex::Regex::new(r"<name>[^<]+</name>").unwrap();
    re.replace(xml, format!("<name>{new_name}</name>").as_str())
        .into_owned()
}

/// 把所有网卡改挂到隔离网络上
fn rewrite_isolated(xml: &str, network: &str) -> String {
    let iface_re = regex::Regex::new(r#"<interface type="(network|bridge)">"#).unwrap();
    let source_re =
        regex::Regex::new(r#"<source (network|bridge)="[^"]*"/>"#).unwrap();
    let xml = iface_re.replace_all(xml, r#"<interface type="network">"#);
    source_re
        .replace_all(&xml, format!(r#"<source network="{network}"/>"#).as_str())
        .into_owned()
}
