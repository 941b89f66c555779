//! # canhal Frame
//!
//! CAN 帧值类型定义（无硬件依赖）
//!
//! ## 内容
//!
//! - [`CanFrame`]: 各后端之间传递的统一帧类型
//! - [`FrameFlags`]: 扩展帧 / 远程帧 / 错误帧标志位（单字节位域）
//! - [`RawCanFrame`]: 与后端模块 ABI 对齐的 `#[repr(C)]` 线格式
//!
//! ## 线格式
//!
//! ```text
//! arb_id: u32 | dlc: u8 | data: [u8; 8] | flags: u8 | timestamp_us: u32
//! ```

use bilge::prelude::*;
use thiserror::Error;

/// 标准帧 ID 掩码（11 bit）
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// 扩展帧 ID 掩码（29 bit）
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// CAN 2.0 最大数据长度
pub const CAN_MAX_DLC: usize = 8;

/// 帧标志位（flags 字节）
///
/// bilge 默认使用 LSB first 位序：
/// - Bit 0: 扩展帧（29-bit ID）
/// - Bit 1: 远程帧（RTR）
/// - Bit 2: 错误帧
/// - Bit 3-7: 保留
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub extended: bool,
    pub remote: bool,
    pub error: bool,
    pub reserved: u5,
}

impl FrameFlags {
    /// 从原始字节解析
    pub fn from_byte(byte: u8) -> Self {
        FrameFlags::from(u8::new(byte))
    }

    /// 编码为原始字节
    pub fn to_byte(self) -> u8 {
        u8::from(self).value()
    }
}

/// 帧构造/解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too long: {len} bytes (max 8)")]
    PayloadTooLong { len: usize },

    #[error("Invalid DLC: {dlc} (max 8)")]
    InvalidDlc { dlc: u8 },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidId { id: u32 },
}

/// CAN 2.0 帧的统一抽象
///
/// 平台层所有后端（仿真模块、SocketCAN、厂商硬件驱动）都以 `CanFrame` 交换数据。
/// 帧一旦产生即不可变：字段只能通过访问器读取，时间戳通过
/// [`with_timestamp`](Self::with_timestamp) 生成新值。
///
/// # 示例
///
/// ```rust
/// use canhal_frame::CanFrame;
///
/// let frame = CanFrame::new_extended(0x0204_0001, &[0x01, 0x3E]);
/// assert_eq!(frame.arb_id(), 0x0204_0001);
/// assert_eq!(frame.data_slice(), &[0x01, 0x3E]);
/// assert!(frame.is_extended());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawCanFrame", into = "RawCanFrame"))]
pub struct CanFrame {
    arb_id: u32,
    dlc: u8,
    data: [u8; 8],
    flags: u8,
    timestamp_us: u32,
}

impl CanFrame {
    /// 创建标准帧（超过 8 字节的数据会被截断）
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::build(id as u32 & CAN_SFF_MASK, data, FrameFlags::default())
    }

    /// 创建扩展帧（超过 8 字节的数据会被截断）
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        let mut flags = FrameFlags::default();
        flags.set_extended(true);
        Self::build(id & CAN_EFF_MASK, data, flags)
    }

    /// 严格构造器：拒绝超长数据与越界 ID
    pub fn try_new(id: u32, data: &[u8], flags: FrameFlags) -> Result<Self, FrameError> {
        if data.len() > CAN_MAX_DLC {
            return Err(FrameError::PayloadTooLong { len: data.len() });
        }
        let mask = if flags.extended() {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        if id & !mask != 0 {
            return Err(FrameError::InvalidId { id });
        }
        Ok(Self::build(id, data, flags))
    }

    fn build(arb_id: u32, data: &[u8], flags: FrameFlags) -> Self {
        let mut fixed = [0u8; 8];
        let len = data.len().min(CAN_MAX_DLC);
        fixed[..len].copy_from_slice(&data[..len]);

        Self {
            arb_id,
            dlc: len as u8,
            data: fixed,
            flags: flags.to_byte(),
            timestamp_us: 0, // 默认无时间戳
        }
    }

    /// 返回携带时间戳的新帧
    pub fn with_timestamp(self, timestamp_us: u32) -> Self {
        Self {
            timestamp_us,
            ..self
        }
    }

    /// 仲裁 ID（不含标志位）
    pub fn arb_id(&self) -> u32 {
        self.arb_id
    }

    /// 数据长度码 (0-8)
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// 完整 8 字节数据（未使用部分为 0）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }

    /// 有效数据切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags)
    }

    pub fn is_extended(&self) -> bool {
        self.flags().extended()
    }

    pub fn is_remote(&self) -> bool {
        self.flags().remote()
    }

    pub fn is_error(&self) -> bool {
        self.flags().error()
    }

    /// 单调时钟时间戳（微秒），0 表示不可用
    pub fn timestamp_us(&self) -> u32 {
        self.timestamp_us
    }
}

/// 后端模块 ABI 使用的帧布局
///
/// 也是 `CanFrame` 的序列化格式；反序列化经过 `TryFrom` 校验 DLC。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawCanFrame {
    pub arb_id: u32,
    pub dlc: u8,
    pub data: [u8; 8],
    pub flags: u8,
    pub timestamp_us: u32,
}

impl From<CanFrame> for RawCanFrame {
    fn from(frame: CanFrame) -> Self {
        Self {
            arb_id: frame.arb_id,
            dlc: frame.dlc,
            data: frame.data,
            flags: frame.flags,
            timestamp_us: frame.timestamp_us,
        }
    }
}

impl TryFrom<RawCanFrame> for CanFrame {
    type Error = FrameError;

    fn try_from(raw: RawCanFrame) -> Result<Self, Self::Error> {
        if raw.dlc as usize > CAN_MAX_DLC {
            return Err(FrameError::InvalidDlc { dlc: raw.dlc });
        }
        // 清零 DLC 之外的字节，保证相等比较只看有效数据
        let mut data = [0u8; 8];
        data[..raw.dlc as usize].copy_from_slice(&raw.data[..raw.dlc as usize]);
        Ok(Self {
            arb_id: raw.arb_id,
            dlc: raw.dlc,
            data,
            flags: raw.flags,
            timestamp_us: raw.timestamp_us,
        })
    }
}
