//! V2K 映射器
//!
//! 把源描述符里的存储路径和虚拟网络引用重写到目标命名空间。
//! 规则是每个任务显式传入的不可变有序列表，从不依赖全局状态，
//! 并发任务因此互不影响。

mod datastore;
mod network;

pub use datastore::{DatastoreMap, MappingRule, Resolution};
pub use network::{NetworkMap, NetworkRule, NetworkTarget};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapperError {
    /// 磁盘引用未被任何规则覆盖。故意设为致命错误：
    /// 虚拟机触及的每个数据存储都必须显式映射，防止静默丢数据。
    #[error("磁盘引用 {path} 未命中任何数据存储映射规则")]
    UnmappedPath { path: PathBuf },

    #[error("映射规则格式错误: {0}")]
    InvalidRule(String),
}

pub type Result<T> = std::result::Result<T, MapperError>;
