//! 平台层错误类型定义

use canhal_can::{CanError, ErrorCode};
use std::path::PathBuf;
use thiserror::Error;

/// 平台层错误类型
#[derive(Error, Debug)]
pub enum PlatformError {
    /// 后端错误
    #[error("CAN backend error: {0}")]
    Can(#[from] CanError),

    /// 读取配置文件失败
    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML 解析失败
    #[error("Invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 配置值非法
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// 平台已释放
    #[error("Platform disposed")]
    Disposed,
}

impl PlatformError {
    /// 映射到平台状态码
    pub fn code(&self) -> ErrorCode {
        match self {
            PlatformError::Can(e) => e.code(),
            PlatformError::ConfigIo { .. }
            | PlatformError::ConfigParse(_)
            | PlatformError::InvalidConfig(_) => ErrorCode::InvalidParamValue,
            PlatformError::Disposed => ErrorCode::GeneralError,
        }
    }

    /// 原始状态值（后端模块的非零返回值原样透传）
    pub fn status(&self) -> i32 {
        match self {
            PlatformError::Can(e) => e.status(),
            other => other.code().as_raw(),
        }
    }
}
