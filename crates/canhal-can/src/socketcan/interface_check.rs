//! 绑定前的接口预检
//!
//! 接口必须存在且处于 UP 状态才绑定 raw CAN socket。波特率和 UP/DOWN 由
//! `ip link` 配置，这里只读取，不需要特殊权限。

use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use nix::net::if_::{InterfaceFlags, if_nametoindex};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use tracing::trace;

/// IFNAMSIZ - 1
const MAX_IFACE_NAME_LEN: usize = 15;

/// 确认接口可用，返回其 ifindex
///
/// | 情况 | 错误 |
/// |---|---|
/// | 名称为空、过长或含 NUL | `InvalidParam` |
/// | 接口不存在 | `Device(NotFound)` |
/// | 存在但 DOWN | `Device(NotUp)` |
/// | socket / ioctl 失败 | `Io` |
pub fn ensure_interface_up(interface: &str) -> Result<u32, CanError> {
    let name = interface_name(interface)?;

    let ifindex = if_nametoindex(name.as_c_str()).map_err(|errno| {
        CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotFound,
            format!(
                "CAN interface '{}' does not exist ({}). Create it with:\n  sudo ip link add dev {} type vcan",
                interface, errno, interface
            ),
        ))
    })?;

    let flags = link_flags(&name)?;
    if !flags.contains(InterfaceFlags::IFF_UP) {
        return Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotUp,
            format!(
                "CAN interface '{}' exists but is not UP. Start it with:\n  sudo ip link set up {}",
                interface, interface
            ),
        )));
    }

    trace!("CAN interface '{}' (ifindex {}) is UP, flags {:?}", interface, ifindex, flags);
    Ok(ifindex)
}

fn interface_name(interface: &str) -> Result<CString, CanError> {
    if interface.is_empty() || interface.len() > MAX_IFACE_NAME_LEN {
        return Err(CanError::InvalidParam(format!(
            "Interface name '{}' must be 1..={} bytes",
            interface, MAX_IFACE_NAME_LEN
        )));
    }
    CString::new(interface)
        .map_err(|e| CanError::InvalidParam(format!("Invalid interface name: {}", e)))
}

/// `ioctl(SIOCGIFFLAGS)` 读取链路标志
fn link_flags(name: &CStr) -> Result<InterfaceFlags, CanError> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    // interface_name 已保证含 NUL 不超过 IFNAMSIZ
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.to_bytes_with_nul()) {
        *dst = *src as libc::c_char;
    }

    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr as *mut libc::ifreq) };
    if rc < 0 {
        return Err(CanError::Io(io::Error::last_os_error()));
    }

    let raw = unsafe { ifr.ifr_ifru.ifru_flags };
    Ok(InterfaceFlags::from_bits_truncate(raw as libc::c_int))
}
