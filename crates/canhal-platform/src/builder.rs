//! Builder 模式实现
//!
//! 提供链式构造 `Platform` 实例的便捷方式。

use crate::platform::Transport;
use crate::{BackendKind, Platform, PlatformConfig, PlatformError};
use canhal_can::loader::{EntryPoints, ModuleLoader};
use canhal_can::session::VendorLoader;
use canhal_can::{
    BackendRegistry, CanTransport, DeviceSession, DeviceType, NeoViLoader, SessionConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_os = "linux")]
use canhal_can::SocketCanTransport;

type HardwareFactory = Box<dyn FnOnce(SessionConfig) -> Box<dyn CanTransport>>;

/// Platform Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use canhal_platform::{BackendKind, PlatformBuilder};
/// use canhal_can::DeviceType;
///
/// let platform = PlatformBuilder::new()
///     .backend(BackendKind::Simulation)
///     .module_path(DeviceType::TalonSrx, "/opt/sim/libtalon.so")
///     .build()
///     .unwrap();
/// platform.create_backend(DeviceType::TalonSrx, 4).unwrap();
/// ```
pub struct PlatformBuilder {
    config: PlatformConfig,
    /// 仿真模块加载器（默认 libloading）
    module_loader: Option<Arc<dyn ModuleLoader>>,
    /// 厂商驱动（默认 icsneo40）
    hardware: Option<HardwareFactory>,
}

impl PlatformBuilder {
    pub fn new() -> Self {
        Self::from_config(PlatformConfig::default())
    }

    pub fn from_config(config: PlatformConfig) -> Self {
        Self {
            config,
            module_loader: None,
            hardware: None,
        }
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    /// SocketCAN 接口，`start()` 时绑定
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.config.interface = Some(interface.into());
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    /// 覆盖某个设备类型的模块路径（优先于环境变量）
    pub fn module_path(mut self, device: DeviceType, path: impl Into<PathBuf>) -> Self {
        self.config
            .module_paths
            .insert(device.to_string(), path.into());
        self
    }

    pub fn entry_points(mut self, entry_points: EntryPoints) -> Self {
        self.config.entry_points.start = entry_points.start;
        self.config.entry_points.send = entry_points.send;
        self.config.entry_points.receive = entry_points.receive;
        self
    }

    pub fn vendor_library(mut self, library: impl Into<String>) -> Self {
        self.config.vendor_library = Some(library.into());
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn rx_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.rx_queue_capacity = capacity;
        self
    }

    pub fn max_devices(mut self, max: usize) -> Self {
        self.config.max_devices = max;
        self
    }

    /// 替换仿真模块加载器
    pub fn module_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.module_loader = Some(loader);
        self
    }

    /// 替换厂商驱动加载器
    pub fn vendor_loader<L>(mut self, loader: L) -> Self
    where
        L: VendorLoader + 'static,
    {
        self.hardware = Some(Box::new(move |config| {
            Box::new(DeviceSession::new(loader, config)) as Box<dyn CanTransport>
        }));
        self
    }

    /// 构建 Platform
    ///
    /// # Errors
    /// - `PlatformError::InvalidConfig`: 配置值非法
    /// - `CanError::Unsupported`: 非 Linux 平台选择 SocketCAN
    pub fn build(self) -> Result<Platform, PlatformError> {
        let config = self.config;
        config.validate()?;

        let transport = match config.backend {
            BackendKind::Simulation => {
                let loader_config = config.loader_config()?;
                let registry = match self.module_loader {
                    Some(loader) => BackendRegistry::with_loader(loader_config, loader),
                    None => BackendRegistry::new(loader_config),
                };
                Transport::Simulation(registry)
            },
            BackendKind::SocketCan => build_socketcan(&config)?,
            BackendKind::Hardware => {
                let session_config = config.session_config();
                let session: Box<dyn CanTransport> = match (self.hardware, &config.vendor_library) {
                    (Some(factory), _) => factory(session_config),
                    (None, Some(library)) => {
                        Box::new(DeviceSession::new(NeoViLoader::new(library), session_config))
                    },
                    (None, None) => {
                        Box::new(DeviceSession::new(NeoViLoader::default(), session_config))
                    },
                };
                Transport::Hardware(session)
            },
        };

        let interface = match config.backend {
            BackendKind::SocketCan => config.interface.clone(),
            _ => None,
        };
        Ok(Platform::new(config.backend, transport, interface))
    }
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn build_socketcan(config: &PlatformConfig) -> Result<Transport, PlatformError> {
    Ok(Transport::SocketCan(SocketCanTransport::new(
        config.socketcan_config(),
    )))
}

#[cfg(not(target_os = "linux"))]
fn build_socketcan(_config: &PlatformConfig) -> Result<Transport, PlatformError> {
    Err(canhal_can::CanError::Unsupported("SocketCAN is only available on Linux".to_string()).into())
}
