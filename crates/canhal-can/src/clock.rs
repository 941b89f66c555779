//! 单调微秒时钟
//!
//! 帧时间戳只有 32 bit。以后端创建时刻为零点计时，避免直接截断系统时间导致溢出；
//! 超过 `u32::MAX` 微秒（约 71 分钟）后回绕。

use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// 距零点的微秒数（回绕）
    pub fn now_us(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
