//! # canhal CAN Backend Layer
//!
//! CAN 后端抽象层，为上层提供统一的收发接口。
//!
//! ## 后端
//!
//! - [`loader`]: 仿真后端。按设备类型动态加载驱动模块，多个模块之间扇出收发
//! - [`session`]: 厂商硬件后端。单条物理链路的生命周期状态机，带掉线自恢复
//! - `socketcan`: Linux 内核 CAN socket（仅 Linux）
//!
//! 所有后端都实现 [`CanTransport`]，上层（facade）只面向该 trait 分发调用。

use std::path::PathBuf;
use thiserror::Error;

pub use canhal_frame::{CanFrame, FrameError, FrameFlags, RawCanFrame};

pub mod clock;
pub mod loader;
pub mod queue;
pub mod session;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub use clock::MonotonicClock;
pub use loader::{BackendKey, BackendModule, BackendRegistry, DeviceType, LoaderConfig};
pub use queue::FrameQueue;
pub use session::{DeviceSession, NeoViLoader, SessionConfig, SessionState};

#[cfg(target_os = "linux")]
pub use socketcan::{SocketCanBackend, SocketCanConfig, SocketCanTransport};

/// 平台状态码
///
/// 每个公开操作最终都可以映射为一个状态码，供只关心返回码的调用方分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidParamValue = -2,
    GeneralError = -100,
    LibraryCouldNotBeLoaded = -800,
    ResourceNotAvailable = -802,
    FeatureNotSupported = -900,
    NotImplemented = -1000,
}

impl ErrorCode {
    /// 从原始状态值解析（未知值返回 `None`）
    pub fn from_raw(status: i32) -> Option<Self> {
        match status {
            0 => Some(Self::Ok),
            -2 => Some(Self::InvalidParamValue),
            -100 => Some(Self::GeneralError),
            -800 => Some(Self::LibraryCouldNotBeLoaded),
            -802 => Some(Self::ResourceNotAvailable),
            -900 => Some(Self::FeatureNotSupported),
            -1000 => Some(Self::NotImplemented),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// CAN 后端层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    #[error("Backend {0} already exists")]
    AlreadyExists(BackendKey),
    #[error("Module path for {device:?} not set (environment variable {var})")]
    ModulePathUnset { device: DeviceType, var: &'static str },
    #[error("Failed to stage module {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to load module: {0}")]
    ModuleLoad(String),
    #[error("Backend module returned status {status}")]
    Backend { status: i32 },
    #[error("Driver library could not be loaded: {0}")]
    LibraryNotLoaded(String),
    #[error("No hardware device available")]
    NoDevice,
    #[error("Session disposed")]
    Disposed,
    #[error("Device not started")]
    NotStarted,
    #[error("Receive queue overflow (capacity {capacity})")]
    BufferOverflow { capacity: usize },
    #[error("Transmit failed: {0}")]
    Transmit(String),
    #[error("Feature not supported: {0}")]
    Unsupported(String),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

impl CanError {
    /// 映射到平台状态码
    pub fn code(&self) -> ErrorCode {
        match self {
            CanError::InvalidParam(_) | CanError::ModulePathUnset { .. } | CanError::Frame(_) => {
                ErrorCode::InvalidParamValue
            },
            CanError::LibraryNotLoaded(_) => ErrorCode::LibraryCouldNotBeLoaded,
            CanError::NoDevice => ErrorCode::ResourceNotAvailable,
            CanError::Device(e) if e.kind == CanDeviceErrorKind::NotFound => {
                ErrorCode::ResourceNotAvailable
            },
            CanError::Unsupported(_) => ErrorCode::FeatureNotSupported,
            CanError::NotImplemented(_) => ErrorCode::NotImplemented,
            CanError::Backend { status } => {
                ErrorCode::from_raw(*status).unwrap_or(ErrorCode::GeneralError)
            },
            _ => ErrorCode::GeneralError,
        }
    }

    /// 原始状态值
    ///
    /// 后端模块自身返回的非零状态原样透传，其余错误取 [`code`](Self::code) 的值。
    pub fn status(&self) -> i32 {
        match self {
            CanError::Backend { status } => *status,
            other => other.code().as_raw(),
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NotUp,
    LinkDropped,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// 统一收发接口
///
/// 所有操作都是同步的；实现必须可以在多个线程间共享（`&self` 调用）。
pub trait CanTransport: Send + Sync {
    /// 发送一帧
    fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError>;

    /// 接收帧，最多填满 `out`，返回实际填充数量
    ///
    /// 没有数据时返回 `Ok(0)`，不是错误。
    fn receive_frames(&self, out: &mut [CanFrame]) -> Result<usize, CanError>;

    /// 释放底层资源（幂等）
    fn dispose(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_raw_roundtrip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::InvalidParamValue,
            ErrorCode::GeneralError,
            ErrorCode::LibraryCouldNotBeLoaded,
            ErrorCode::ResourceNotAvailable,
            ErrorCode::FeatureNotSupported,
            ErrorCode::NotImplemented,
        ] {
            assert_eq!(ErrorCode::from_raw(code.as_raw()), Some(code));
        }
        assert_eq!(ErrorCode::from_raw(-1), None);
        assert_eq!(ErrorCode::Ok.as_raw(), 0);
    }

    #[test]
    fn test_can_error_code_mapping() {
        assert_eq!(
            CanError::InvalidParam("capacity".into()).code(),
            ErrorCode::InvalidParamValue
        );
        assert_eq!(
            CanError::LibraryNotLoaded("icsneo40".into()).code(),
            ErrorCode::LibraryCouldNotBeLoaded
        );
        assert_eq!(CanError::NoDevice.code(), ErrorCode::ResourceNotAvailable);
        assert_eq!(CanError::Disposed.code(), ErrorCode::GeneralError);
        assert_eq!(
            CanError::BufferOverflow { capacity: 1000 }.code(),
            ErrorCode::GeneralError
        );
        assert_eq!(
            CanError::NotImplemented("create_backend").code(),
            ErrorCode::NotImplemented
        );
        assert_eq!(
            CanError::ModuleLoad("bad elf".into()).code(),
            ErrorCode::GeneralError
        );
    }

    #[test]
    fn test_backend_status_passthrough() {
        let err = CanError::Backend { status: 7 };
        assert_eq!(err.status(), 7);
        assert_eq!(err.code(), ErrorCode::GeneralError);

        let err = CanError::Backend { status: -2 };
        assert_eq!(err.code(), ErrorCode::InvalidParamValue);
    }

    #[test]
    fn test_device_not_found_maps_to_resource_not_available() {
        let err = CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotFound,
            "vcan9 does not exist",
        ));
        assert_eq!(err.code(), ErrorCode::ResourceNotAvailable);

        let err = CanError::Device("something odd".into());
        assert_eq!(err.code(), ErrorCode::GeneralError);
    }

    #[test]
    fn test_can_error_display() {
        let err = CanError::AlreadyExists(BackendKey::new(DeviceType::TalonSrx, 4));
        assert!(err.to_string().contains("already exists"));

        let err = CanError::BufferOverflow { capacity: 1000 };
        assert!(err.to_string().to_lowercase().contains("overflow"));
    }

    #[test]
    fn test_can_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "test");
        let can_err: CanError = io_err.into();
        assert!(matches!(can_err, CanError::Io(_)));
        assert_eq!(can_err.status(), ErrorCode::GeneralError.as_raw());
    }
}
