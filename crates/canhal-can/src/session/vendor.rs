//! 厂商驱动接口
//!
//! 会话只依赖这里的两个 trait；真实实现见 [`neovi`](super::neovi)，测试里用 Mock 替换。

use crate::{CanError, CanFrame, FrameError, FrameFlags};
use bilge::prelude::*;
use canhal_frame::CAN_EFF_MASK;
use std::num::NonZeroUsize;
use std::time::Duration;

/// 高速 CAN 逻辑通道
pub const NETID_HSCAN: u8 = 1;

/// "no response"：设备掉线
pub const NEOVI_ERROR_NO_RESPONSE: u32 = 75;

/// 厂商消息状态位（低 4 bit 有意义）
///
/// - Bit 0: 总线错误
/// - Bit 1: 本机发送回显
/// - Bit 2: 扩展帧
/// - Bit 3: 远程帧
#[bitsize(32)]
#[derive(FromBits, DebugBits, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpyStatus {
    pub global_err: bool,
    pub tx_msg: bool,
    pub xtd_frame: bool,
    pub remote_frame: bool,
    pub reserved: u28,
}

impl SpyStatus {
    pub fn from_raw(raw: u32) -> Self {
        SpyStatus::from(raw)
    }

    pub fn to_raw(self) -> u32 {
        u32::from(self)
    }
}

/// 已打开设备的不透明句柄（非零）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(NonZeroUsize);

impl DeviceHandle {
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn raw(self) -> usize {
        self.0.get()
    }
}

/// 与厂商库无关的消息表示
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VendorMessage {
    pub status: SpyStatus,
    pub network_id: u8,
    pub arb_id: u32,
    pub data: [u8; 8],
    pub len: u8,
}

impl VendorMessage {
    /// 发送方向：总是以扩展帧发出
    pub fn from_frame(frame: &CanFrame) -> Self {
        let mut status = SpyStatus::default();
        status.set_xtd_frame(true);
        status.set_remote_frame(frame.is_remote());
        Self {
            status,
            network_id: NETID_HSCAN,
            arb_id: frame.arb_id(),
            data: *frame.data(),
            len: frame.dlc(),
        }
    }

    /// 是否应交给上层（逻辑通道正确、不是回显、不是总线错误）
    pub fn is_deliverable(&self) -> bool {
        self.network_id == NETID_HSCAN && !self.status.tx_msg() && !self.status.global_err()
    }

    pub fn to_frame(&self, timestamp_us: u32) -> Result<CanFrame, FrameError> {
        let len = self.len as usize;
        if len > self.data.len() {
            return Err(FrameError::InvalidDlc { dlc: self.len });
        }
        let mut flags = FrameFlags::default();
        flags.set_extended(self.status.xtd_frame());
        flags.set_remote(self.status.remote_frame());
        let frame = CanFrame::try_new(self.arb_id & CAN_EFF_MASK, &self.data[..len], flags)?;
        Ok(frame.with_timestamp(timestamp_us))
    }
}

/// 等待接收通知的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxWait {
    Ready,
    Timeout,
    /// 驱动报告失败，需要查询最近错误码
    Failed,
}

/// 已加载的厂商驱动
pub trait VendorDriver: Send + Sync {
    /// 枚举最多 `max_devices` 个设备并打开第一个；没有设备时返回 `Ok(None)`
    fn open_first(&self, max_devices: usize) -> Result<Option<DeviceHandle>, CanError>;

    fn close(&self, handle: DeviceHandle) -> Result<(), CanError>;

    /// 提交一条消息；驱动接受则 `Ok`
    fn transmit(&self, handle: DeviceHandle, message: &VendorMessage) -> Result<(), CanError>;

    fn wait_for_rx(&self, handle: DeviceHandle, timeout: Duration) -> RxWait;

    /// 取出驱动缓存中的全部待处理消息
    fn fetch_messages(&self, handle: DeviceHandle) -> Result<Vec<VendorMessage>, CanError>;

    fn last_api_error(&self, handle: DeviceHandle) -> Option<u32>;
}

/// 厂商驱动加载器
pub trait VendorLoader: Send + Sync {
    type Driver: VendorDriver + 'static;

    fn load(&self) -> Result<Self::Driver, CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spy_status_bits() {
        let status = SpyStatus::from_raw(0x02 | 0x04);
        assert!(!status.global_err());
        assert!(status.tx_msg());
        assert!(status.xtd_frame());
        assert!(!status.remote_frame());
        assert_eq!(status.to_raw(), 0x06);
    }

    #[test]
    fn test_device_handle_rejects_null() {
        assert!(DeviceHandle::new(0).is_none());
        assert_eq!(DeviceHandle::new(0x1234).unwrap().raw(), 0x1234);
    }

    #[test]
    fn test_from_frame_forces_extended() {
        let frame = CanFrame::new_standard(0x123, &[1, 2, 3]);
        let msg = VendorMessage::from_frame(&frame);
        assert!(msg.status.xtd_frame());
        assert_eq!(msg.network_id, NETID_HSCAN);
        assert_eq!(msg.arb_id, 0x123);
        assert_eq!(msg.len, 3);
        assert_eq!(&msg.data[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_deliverable_filter() {
        let frame = CanFrame::new_extended(0x0204_0001, &[0; 8]);
        let msg = VendorMessage::from_frame(&frame);
        assert!(msg.is_deliverable());

        let mut echo = msg;
        echo.status.set_tx_msg(true);
        assert!(!echo.is_deliverable());

        let mut bus_error = msg;
        bus_error.status.set_global_err(true);
        assert!(!bus_error.is_deliverable());

        let mut other_net = msg;
        other_net.network_id = 2;
        assert!(!other_net.is_deliverable());
    }

    #[test]
    fn test_to_frame_masks_id_and_stamps() {
        let mut msg = VendorMessage {
            arb_id: 0xE204_0001,
            len: 2,
            data: [9, 8, 0, 0, 0, 0, 0, 0],
            network_id: NETID_HSCAN,
            ..Default::default()
        };
        msg.status.set_xtd_frame(true);

        let frame = msg.to_frame(42).unwrap();
        assert_eq!(frame.arb_id(), 0x0204_0001);
        assert_eq!(frame.data_slice(), &[9, 8]);
        assert!(frame.is_extended());
        assert_eq!(frame.timestamp_us(), 42);
    }

    #[test]
    fn test_to_frame_rejects_bad_length() {
        let msg = VendorMessage {
            len: 9,
            ..Default::default()
        };
        assert!(matches!(msg.to_frame(0), Err(FrameError::InvalidDlc { dlc: 9 })));
    }
}
