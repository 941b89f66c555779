//! 平台门面
//!
//! 每个 [`Platform`] 持有且仅持有一个传输，由 [`BackendKind`] 决定。
//! 仿真后端的 create/destroy 只对仿真传输有意义，其他传输返回 `NotImplemented`。

use crate::{BackendKind, PlatformError};
use canhal_can::{BackendRegistry, CanError, CanFrame, CanTransport, DeviceType};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

#[cfg(target_os = "linux")]
use canhal_can::SocketCanTransport;

pub(crate) enum Transport {
    Simulation(BackendRegistry),
    #[cfg(target_os = "linux")]
    SocketCan(SocketCanTransport),
    Hardware(Box<dyn CanTransport>),
}

impl Transport {
    fn as_transport(&self) -> &dyn CanTransport {
        match self {
            Transport::Simulation(registry) => registry,
            #[cfg(target_os = "linux")]
            Transport::SocketCan(socket) => socket,
            Transport::Hardware(session) => session.as_ref(),
        }
    }
}

/// CAN 平台
pub struct Platform {
    kind: BackendKind,
    transport: Transport,
    /// `start()` 时绑定的 SocketCAN 接口
    interface: Option<String>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Platform {
    pub(crate) fn new(kind: BackendKind, transport: Transport, interface: Option<String>) -> Self {
        Self {
            kind,
            transport,
            interface,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<(), PlatformError> {
        if self.is_disposed() {
            return Err(PlatformError::Disposed);
        }
        Ok(())
    }

    /// 启动（幂等）
    ///
    /// SocketCAN 传输在这里绑定配置中的接口。
    pub fn start(&self) -> Result<(), PlatformError> {
        self.check_live()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(interface) = &self.interface {
            if let Err(e) = self.set_interface(interface) {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        }
        debug!("Platform started ({:?})", self.kind);
        Ok(())
    }

    /// 释放（幂等，drop 时也会调用）
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.as_transport().dispose();
        debug!("Platform disposed ({:?})", self.kind);
    }

    fn registry(&self, operation: &'static str) -> Result<&BackendRegistry, PlatformError> {
        self.check_live()?;
        match &self.transport {
            Transport::Simulation(registry) => Ok(registry),
            _ => Err(CanError::NotImplemented(operation).into()),
        }
    }

    /// 加载并启动一个仿真后端
    pub fn create_backend(&self, device: DeviceType, id: i32) -> Result<(), PlatformError> {
        Ok(self.registry("create_backend")?.create(device, id)?)
    }

    /// 卸载一个仿真后端；不存在时返回 `Ok(false)`
    pub fn destroy_backend(&self, device: DeviceType, id: i32) -> Result<bool, PlatformError> {
        Ok(self.registry("destroy_backend")?.destroy(device, id))
    }

    /// 卸载全部仿真后端
    pub fn destroy_all(&self) -> Result<usize, PlatformError> {
        Ok(self.registry("destroy_all")?.destroy_all())
    }

    /// 已注册的仿真后端数量（非仿真传输为 0）
    pub fn backend_count(&self) -> usize {
        match &self.transport {
            Transport::Simulation(registry) => registry.len(),
            _ => 0,
        }
    }

    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), PlatformError> {
        self.check_live()?;
        Ok(self.transport.as_transport().send_frame(frame)?)
    }

    /// 接收帧，返回填入 `out` 的数量
    pub fn receive_frames(&self, out: &mut [CanFrame]) -> Result<usize, PlatformError> {
        self.check_live()?;
        Ok(self.transport.as_transport().receive_frames(out)?)
    }

    /// 绑定 SocketCAN 接口；其他传输忽略
    pub fn set_interface(&self, interface: &str) -> Result<(), PlatformError> {
        self.check_live()?;
        match &self.transport {
            #[cfg(target_os = "linux")]
            Transport::SocketCan(socket) => Ok(socket.set_interface(interface)?),
            _ => {
                trace!("Ignoring interface '{}' for {:?} platform", interface, self.kind);
                Ok(())
            },
        }
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("kind", &self.kind)
            .field("started", &self.is_started())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
