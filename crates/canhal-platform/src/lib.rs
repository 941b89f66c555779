//! # canhal Platform
//!
//! 电机控制器 SDK 的 CAN 平台层门面。
//!
//! 进程内只有一个 [`Platform`]，选择三种传输之一：
//!
//! - [`BackendKind::Simulation`]: 按设备类型动态加载仿真模块，收发在模块间扇出
//! - [`BackendKind::SocketCan`]: Linux 内核 CAN socket
//! - [`BackendKind::Hardware`]: 厂商 USB 适配器（icsneo40）
//!
//! 所有公开操作都返回 `Result<_, PlatformError>`，可以用 [`PlatformError::code`]
//! 映射成 [`ErrorCode`] 状态码。
//!
//! ```no_run
//! use canhal_platform::{PlatformBuilder, PlatformConfig};
//!
//! canhal_platform::logging::init();
//! let config = PlatformConfig::load("canhal.toml").unwrap();
//! let platform = PlatformBuilder::from_config(config).build().unwrap();
//! platform.start().unwrap();
//! ```

mod builder;
pub mod config;
mod error;
pub mod logging;
mod platform;

pub use builder::PlatformBuilder;
pub use config::{BackendKind, PlatformConfig};
pub use error::PlatformError;
pub use platform::Platform;

pub use canhal_can::{CanError, DeviceType, ErrorCode};
pub use canhal_frame::{CanFrame, FrameFlags, RawCanFrame};

use std::time::Duration;

/// 微秒级休眠
pub fn sleep_us(us: u64) {
    spin_sleep::sleep(Duration::from_micros(us));
}
