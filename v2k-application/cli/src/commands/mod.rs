//! 子命令实现

pub mod convert;
pub mod testboot;
