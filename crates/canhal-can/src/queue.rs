//! 有界接收队列
//!
//! 线程安全的 FIFO，自带独立的锁（与会话的生命周期锁无关），
//! 因此取帧线程不会被并发的 open/close 阻塞。
//!
//! 队列满时 `push` 返回错误而不是静默丢帧：溢出说明消费方长期没有取走数据，
//! 属于容量或背压设计问题，必须让调用方看到。

use crate::{CanError, CanFrame};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// 硬件会话默认容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<CanFrame>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            // 不按满容量预分配，正常情况下队列很浅
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// 追加一帧；已满时返回 `CanError::BufferOverflow`，帧不入队
    pub fn push(&self, frame: CanFrame) -> Result<(), CanError> {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return Err(CanError::BufferOverflow {
                capacity: self.capacity,
            });
        }
        frames.push_back(frame);
        Ok(())
    }

    /// 批量追加，遇到第一次溢出即停止
    ///
    /// 返回成功入队的数量；溢出时已入队的帧保留。
    pub fn extend<I>(&self, batch: I) -> Result<usize, CanError>
    where
        I: IntoIterator<Item = CanFrame>,
    {
        let mut frames = self.frames.lock();
        let mut pushed = 0;
        for frame in batch {
            if frames.len() >= self.capacity {
                return Err(CanError::BufferOverflow {
                    capacity: self.capacity,
                });
            }
            frames.push_back(frame);
            pushed += 1;
        }
        Ok(pushed)
    }

    /// 按到达顺序取出最多 `out.len()` 帧，返回实际数量
    pub fn drain_into(&self, out: &mut [CanFrame]) -> usize {
        let mut frames = self.frames.lock();
        let count = frames.len().min(out.len());
        for (slot, frame) in out.iter_mut().zip(frames.drain(..count)) {
            *slot = frame;
        }
        count
    }

    /// 取出最多 `max` 帧
    pub fn drain(&self, max: usize) -> Vec<CanFrame> {
        let mut frames = self.frames.lock();
        let count = frames.len().min(max);
        frames.drain(..count).collect()
    }

    /// 清空队列，返回被丢弃的帧数
    pub fn clear(&self) -> usize {
        let mut frames = self.frames.lock();
        let dropped = frames.len();
        frames.clear();
        dropped
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
