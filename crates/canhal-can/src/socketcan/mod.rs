//! SocketCAN 后端
//!
//! Linux 内核 CAN socket。每个进程同时只绑定一个接口，重新设置接口会替换旧 socket。
//!
//! - **仅限 Linux 平台**
//! - **接口配置**：波特率、UP/DOWN 由系统工具（`ip link`）完成，这里只检查
//! - 发送总是使用扩展帧 ID；接收一次读取一帧

use crate::{
    CanDeviceError, CanDeviceErrorKind, CanError, CanFrame, CanTransport, FrameError, FrameFlags,
    MonotonicClock,
};
use arc_swap::ArcSwapOption;
use canhal_frame::CAN_EFF_MASK;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socketcan::{CanFrame as KernelFrame, CanSocket, EmbeddedFrame, ExtendedId, Socket};
use std::io;
use std::mem;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

mod interface_check;

pub use interface_check::ensure_interface_up;

const CAN_FRAME_LEN: usize = mem::size_of::<libc::can_frame>();

/// SocketCAN 参数
#[derive(Debug, Clone)]
pub struct SocketCanConfig {
    /// 单次接收的等待上限
    pub poll_timeout: Duration,
    /// 内核回环（默认开启，与内核默认一致）
    pub loopback: bool,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            loopback: true,
        }
    }
}

/// 已绑定的 CAN socket
pub struct SocketCanBackend {
    socket: CanSocket,
    interface: String,
    poll_timeout: Duration,
    clock: MonotonicClock,
}

impl SocketCanBackend {
    /// 检查接口并绑定 raw CAN socket
    pub fn open(interface: &str, config: &SocketCanConfig) -> Result<Self, CanError> {
        let ifindex = ensure_interface_up(interface)?;

        let socket = CanSocket::open(interface).map_err(|e| {
            CanError::Device(format!("Failed to open CAN interface '{}': {}", interface, e).into())
        })?;

        if !config.loopback {
            let disabled: libc::c_int = 0;
            let rc = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_CAN_RAW,
                    libc::CAN_RAW_LOOPBACK,
                    &disabled as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                // 不阻塞初始化
                warn!(
                    "Failed to disable CAN_RAW_LOOPBACK on '{}': {}",
                    interface,
                    io::Error::last_os_error()
                );
            }
        }

        debug!("SocketCAN interface '{}' (ifindex {}) opened", interface, ifindex);
        Ok(Self {
            socket,
            interface: interface.to_string(),
            poll_timeout: config.poll_timeout,
            clock: MonotonicClock::new(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// 发送一帧（强制扩展帧 ID）
    pub fn send(&self, frame: &CanFrame) -> Result<(), CanError> {
        let kernel_frame = ExtendedId::new(frame.arb_id() & CAN_EFF_MASK)
            .and_then(|id| KernelFrame::new(id, frame.data_slice()))
            .ok_or_else(|| {
                CanError::Frame(FrameError::InvalidId { id: frame.arb_id() })
            })?;

        self.socket.write_frame(&kernel_frame).map_err(|e| {
            error!("SocketCAN write on '{}' failed: {}", self.interface, e);
            CanError::Transmit(e.to_string())
        })?;

        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.arb_id(), frame.dlc());
        Ok(())
    }

    /// 等待最多 `poll_timeout` 读取一帧；超时返回 `Ok(None)`
    ///
    /// 错误帧记录日志后丢弃（同样返回 `Ok(None)`）。
    pub fn receive(&self) -> Result<Option<CanFrame>, CanError> {
        let fd = self.socket.as_raw_fd();
        // SAFETY: fd 由 self.socket 持有，在本次调用期间有效
        let pollfd = PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN);
        let timeout_ms = self.poll_timeout.as_millis().min(u16::MAX as u128) as u16;

        match poll(&mut [pollfd], PollTimeout::from(timeout_ms)) {
            Ok(0) => return Ok(None),
            Ok(_) => {},
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => {
                return Err(CanError::Io(io::Error::other(format!("poll failed: {}", e))));
            },
        }

        let mut raw: libc::can_frame = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::read(
                fd,
                &mut raw as *mut libc::can_frame as *mut libc::c_void,
                CAN_FRAME_LEN,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(CanError::Io(err));
        }
        if n as usize != CAN_FRAME_LEN {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::InvalidFrame,
                format!("Incomplete CAN frame: {} bytes (expected {})", n, CAN_FRAME_LEN),
            )));
        }

        self.parse_raw_can_frame(&raw)
    }

    fn parse_raw_can_frame(&self, raw: &libc::can_frame) -> Result<Option<CanFrame>, CanError> {
        let can_id = raw.can_id;
        if can_id & libc::CAN_ERR_FLAG != 0 {
            warn!(
                "CAN error frame on '{}' (class 0x{:X}), ignoring",
                self.interface,
                can_id & libc::CAN_ERR_MASK
            );
            return Ok(None);
        }

        let dlc = raw.can_dlc as usize;
        if dlc > raw.data.len() {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::InvalidFrame,
                format!("Invalid DLC: {} (max 8)", dlc),
            )));
        }

        let mut flags = FrameFlags::default();
        flags.set_extended(can_id & libc::CAN_EFF_FLAG != 0);
        flags.set_remote(can_id & libc::CAN_RTR_FLAG != 0);

        let frame = CanFrame::try_new(can_id & CAN_EFF_MASK, &raw.data[..dlc], flags)?
            .with_timestamp(self.clock.now_us());
        trace!("Received CAN frame: ID=0x{:X}, len={}", frame.arb_id(), dlc);
        Ok(Some(frame))
    }
}

impl Drop for SocketCanBackend {
    fn drop(&mut self) {
        trace!("SocketCAN interface '{}' closed", self.interface);
    }
}

/// 可替换接口的 SocketCAN 传输
///
/// 绑定前发送/接收返回 `CanError::NotStarted`。
pub struct SocketCanTransport {
    config: SocketCanConfig,
    backend: ArcSwapOption<SocketCanBackend>,
}

impl SocketCanTransport {
    pub fn new(config: SocketCanConfig) -> Self {
        Self {
            config,
            backend: ArcSwapOption::empty(),
        }
    }

    /// 绑定接口；已绑定时替换旧 socket
    pub fn set_interface(&self, interface: &str) -> Result<(), CanError> {
        let backend = SocketCanBackend::open(interface, &self.config)?;
        if let Some(old) = self.backend.swap(Some(Arc::new(backend))) {
            debug!("Replaced SocketCAN interface '{}' with '{}'", old.interface(), interface);
        }
        Ok(())
    }

    pub fn interface(&self) -> Option<String> {
        self.backend
            .load_full()
            .map(|b| b.interface().to_string())
    }

    pub fn close(&self) {
        self.backend.store(None);
    }

    fn bound(&self) -> Result<Arc<SocketCanBackend>, CanError> {
        self.backend.load_full().ok_or(CanError::NotStarted)
    }
}

impl CanTransport for SocketCanTransport {
    fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        self.bound()?.send(frame)
    }

    fn receive_frames(&self, out: &mut [CanFrame]) -> Result<usize, CanError> {
        let backend = self.bound()?;
        let Some(slot) = out.first_mut() else {
            return Ok(0);
        };
        match backend.receive()? {
            Some(frame) => {
                *slot = frame;
                Ok(1)
            },
            None => Ok(0),
        }
    }

    fn dispose(&self) {
        self.close();
    }
}
