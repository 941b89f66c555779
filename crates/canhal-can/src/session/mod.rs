//! 厂商硬件会话
//!
//! 单条物理链路的生命周期：`Running → Disposing → Disposed`（终态）。
//!
//! ## 锁
//!
//! - 生命周期锁：保护状态与 load/open/close 的串行化
//! - 接收队列锁：见 [`FrameQueue`]，与生命周期锁互不依赖
//!
//! 已加载的驱动通过 `ArcSwapOption` 无锁共享；设备句柄保存在原子变量里，
//! 强制关闭（拿不到生命周期锁时）通过 `swap(0)` 保证同一个句柄最多关闭一次。

pub mod neovi;
pub mod vendor;

pub use neovi::{NeoViDriver, NeoViLoader};
pub use vendor::{DeviceHandle, RxWait, VendorDriver, VendorLoader, VendorMessage};

use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::{CanError, CanFrame, CanTransport, FrameQueue, MonotonicClock};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use vendor::NEOVI_ERROR_NO_RESPONSE;

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Disposing,
    Disposed,
}

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 单次接收等待通知的超时
    pub poll_timeout: Duration,
    /// 关闭设备时获取生命周期锁的超时，超时后不加锁强制关闭
    pub close_timeout: Duration,
    pub rx_queue_capacity: usize,
    /// 枚举设备的上限
    pub max_devices: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_millis(500),
            rx_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_devices: 10,
        }
    }
}

/// 硬件会话
pub struct DeviceSession<L: VendorLoader> {
    config: SessionConfig,
    loader: L,
    lifecycle: Mutex<SessionState>,
    driver: ArcSwapOption<L::Driver>,
    /// 0 表示未打开
    device: AtomicUsize,
    queue: FrameQueue,
    /// 接收队列溢出次数
    overflows: AtomicU64,
    clock: MonotonicClock,
}

impl<L: VendorLoader> DeviceSession<L> {
    pub fn new(loader: L, config: SessionConfig) -> Self {
        let queue = FrameQueue::new(config.rx_queue_capacity);
        Self {
            config,
            loader,
            lifecycle: Mutex::new(SessionState::Running),
            driver: ArcSwapOption::empty(),
            device: AtomicUsize::new(0),
            queue,
            overflows: AtomicU64::new(0),
            clock: MonotonicClock::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.lifecycle.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn is_driver_loaded(&self) -> bool {
        self.driver.load().is_some()
    }

    pub fn is_device_open(&self) -> bool {
        self.device.load(Ordering::Acquire) != 0
    }

    fn check_running(&self) -> Result<(), CanError> {
        match self.state() {
            SessionState::Running => Ok(()),
            _ => Err(CanError::Disposed),
        }
    }

    fn current_handle(&self) -> Option<DeviceHandle> {
        DeviceHandle::new(self.device.load(Ordering::Acquire))
    }

    /// 加载厂商驱动（已加载则直接返回）
    pub fn load_driver(&self) -> Result<(), CanError> {
        self.driver().map(|_| ())
    }

    fn driver(&self) -> Result<Arc<L::Driver>, CanError> {
        if let Some(driver) = self.driver.load_full() {
            return Ok(driver);
        }

        let state = self.lifecycle.lock();
        if *state != SessionState::Running {
            return Err(CanError::Disposed);
        }
        // 持锁后再检查一次
        if let Some(driver) = self.driver.load_full() {
            return Ok(driver);
        }

        let driver = Arc::new(
            self.loader
                .load()
                .inspect_err(|e| warn!("Failed to load vendor driver: {}", e))?,
        );
        self.driver.store(Some(driver.clone()));
        Ok(driver)
    }

    /// 打开第一个可用设备（已打开则直接返回句柄）
    pub fn open_device(&self) -> Result<DeviceHandle, CanError> {
        if let Some(handle) = self.current_handle() {
            return Ok(handle);
        }
        let driver = self.driver()?;

        let state = self.lifecycle.lock();
        // 并发的 dispose 已经开始，不能再打开
        if *state != SessionState::Running {
            return Err(CanError::Disposed);
        }
        if let Some(handle) = self.current_handle() {
            return Ok(handle);
        }

        match driver.open_first(self.config.max_devices)? {
            Some(handle) => {
                self.device.store(handle.raw(), Ordering::Release);
                debug!("Hardware device opened");
                Ok(handle)
            },
            None => {
                warn!(
                    "No hardware device available (searched up to {})",
                    self.config.max_devices
                );
                Err(CanError::NoDevice)
            },
        }
    }

    /// 关闭设备
    ///
    /// 在 `close_timeout` 内拿不到生命周期锁时不加锁直接关闭。总是返回成功。
    pub fn close_device(&self) -> Result<(), CanError> {
        match self.lifecycle.try_lock_for(self.config.close_timeout) {
            Some(_guard) => self.release_device(),
            None => {
                warn!(
                    "Lifecycle lock busy for {:?}, forcing device close",
                    self.config.close_timeout
                );
                self.release_device();
            },
        }
        Ok(())
    }

    fn release_device(&self) {
        let Some(handle) = DeviceHandle::new(self.device.swap(0, Ordering::AcqRel)) else {
            return;
        };
        if let Some(driver) = self.driver.load_full() {
            if let Err(e) = driver.close(handle) {
                warn!("Failed to close hardware device: {}", e);
            }
        }
        debug!("Hardware device closed");
    }

    /// 发送一帧（总是以扩展帧发出）
    pub fn send(&self, frame: &CanFrame) -> Result<(), CanError> {
        self.check_running()?;
        let driver = self.driver()?;
        let handle = self.open_device()?;

        let message = VendorMessage::from_frame(frame);
        driver
            .transmit(handle, &message)
            .inspect_err(|e| warn!("Failed to transmit 0x{:X}: {}", frame.arb_id(), e))?;
        trace!("Sent frame 0x{:X}", frame.arb_id());
        Ok(())
    }

    /// 接收帧，最多填满 `out`
    ///
    /// 等待超时不是错误，返回 0。队列满时本批剩余消息被丢弃并计入
    /// [`overflow_count`](Self::overflow_count)，已排队的帧照常取出。
    pub fn receive(&self, out: &mut [CanFrame]) -> Result<usize, CanError> {
        self.check_running()?;
        let driver = self.driver()?;
        let handle = self.open_device()?;

        match driver.wait_for_rx(handle, self.config.poll_timeout) {
            RxWait::Timeout => {},
            RxWait::Ready => self.pull_messages(driver.as_ref(), handle)?,
            RxWait::Failed => match driver.last_api_error(handle) {
                Some(NEOVI_ERROR_NO_RESPONSE) => {
                    error!("Hardware device stopped responding, closing and flushing queue");
                    self.close_device()?;
                    let dropped = self.queue.clear();
                    debug!("Dropped {} queued frame(s) after link loss", dropped);
                },
                Some(code) => warn!("Vendor API error {} while waiting for frames", code),
                None => trace!("Wait for frames failed without a vendor error"),
            },
        }

        Ok(self.queue.drain_into(out))
    }

    fn pull_messages(&self, driver: &L::Driver, handle: DeviceHandle) -> Result<(), CanError> {
        let messages = driver.fetch_messages(handle)?;
        let now = self.clock.now_us();

        let frames = messages
            .iter()
            .filter(|m| m.is_deliverable())
            .filter_map(|m| match m.to_frame(now) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!("Dropping malformed vendor message: {}", e);
                    None
                },
            });

        match self.queue.extend(frames) {
            Ok(count) => trace!("Queued {} of {} vendor message(s)", count, messages.len()),
            Err(e) => {
                // 丢弃本批剩余消息；队列中已有的帧仍按 FIFO 交付
                let total = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                error!("{} (dropped rest of batch, {} overflow(s) so far)", e, total);
            },
        }
        Ok(())
    }

    /// 释放会话（幂等）
    ///
    /// 第二次调用看到非 Running 状态直接返回，不访问硬件。
    pub fn dispose(&self) {
        {
            let mut state = self.lifecycle.lock();
            if *state != SessionState::Running {
                trace!("Session already {:?}", *state);
                return;
            }
            *state = SessionState::Disposing;
        }

        // close_device 总是成功
        let _ = self.close_device();
        let dropped = self.queue.clear();

        *self.lifecycle.lock() = SessionState::Disposed;
        self.driver.store(None);
        debug!("Session disposed ({} queued frame(s) dropped)", dropped);
    }
}

impl<L: VendorLoader> CanTransport for DeviceSession<L> {
    fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        self.send(frame)
    }

    fn receive_frames(&self, out: &mut [CanFrame]) -> Result<usize, CanError> {
        self.receive(out)
    }

    fn dispose(&self) {
        DeviceSession::dispose(self);
    }
}

impl<L: VendorLoader> Drop for DeviceSession<L> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::vendor::{NETID_HSCAN, SpyStatus};
    use super::*;
    use crate::ErrorCode;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct MockHardware {
        no_device: bool,
        transmit_fails: bool,
        next_handle: usize,
        opens: usize,
        closes: usize,
        /// 所有驱动调用计数
        calls: usize,
        sent: Vec<VendorMessage>,
        waits: VecDeque<RxWait>,
        pending: Vec<VendorMessage>,
        last_error: Option<u32>,
    }

    #[derive(Clone, Default)]
    struct MockDriver {
        hw: Arc<Mutex<MockHardware>>,
    }

    impl VendorDriver for MockDriver {
        fn open_first(&self, _max_devices: usize) -> Result<Option<DeviceHandle>, CanError> {
            let mut hw = self.hw.lock();
            hw.calls += 1;
            if hw.no_device {
                return Ok(None);
            }
            hw.opens += 1;
            hw.next_handle += 0x10;
            Ok(DeviceHandle::new(hw.next_handle))
        }

        fn close(&self, _handle: DeviceHandle) -> Result<(), CanError> {
            let mut hw = self.hw.lock();
            hw.calls += 1;
            hw.closes += 1;
            Ok(())
        }

        fn transmit(&self, _handle: DeviceHandle, message: &VendorMessage) -> Result<(), CanError> {
            let mut hw = self.hw.lock();
            hw.calls += 1;
            if hw.transmit_fails {
                return Err(CanError::Transmit("mock rejected".into()));
            }
            hw.sent.push(*message);
            Ok(())
        }

        fn wait_for_rx(&self, _handle: DeviceHandle, _timeout: Duration) -> RxWait {
            let mut hw = self.hw.lock();
            hw.calls += 1;
            match hw.waits.pop_front() {
                Some(wait) => wait,
                None if hw.pending.is_empty() => RxWait::Timeout,
                None => RxWait::Ready,
            }
        }

        fn fetch_messages(&self, _handle: DeviceHandle) -> Result<Vec<VendorMessage>, CanError> {
            let mut hw = self.hw.lock();
            hw.calls += 1;
            Ok(std::mem::take(&mut hw.pending))
        }

        fn last_api_error(&self, _handle: DeviceHandle) -> Option<u32> {
            let mut hw = self.hw.lock();
            hw.calls += 1;
            hw.last_error
        }
    }

    #[derive(Default)]
    struct MockLoader {
        driver: MockDriver,
        fail: AtomicBool,
        loads: AtomicUsize,
    }

    impl VendorLoader for Arc<MockLoader> {
        type Driver = MockDriver;

        fn load(&self) -> Result<MockDriver, CanError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CanError::LibraryNotLoaded("mock".into()));
            }
            Ok(self.driver.clone())
        }
    }

    fn session_with(config: SessionConfig) -> (DeviceSession<Arc<MockLoader>>, Arc<MockLoader>) {
        let loader = Arc::new(MockLoader::default());
        (DeviceSession::new(loader.clone(), config), loader)
    }

    fn session() -> (DeviceSession<Arc<MockLoader>>, Arc<MockLoader>) {
        session_with(SessionConfig {
            close_timeout: Duration::from_millis(20),
            ..Default::default()
        })
    }

    fn rx_message(id: u32, payload: &[u8]) -> VendorMessage {
        let mut status = SpyStatus::default();
        status.set_xtd_frame(true);
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        VendorMessage {
            status,
            network_id: NETID_HSCAN,
            arb_id: id,
            data,
            len: payload.len() as u8,
        }
    }

    #[test]
    fn test_new_session_is_running_and_lazy() {
        let (session, loader) = session();
        assert_eq!(session.state(), SessionState::Running);
        assert!(!session.is_driver_loaded());
        assert!(!session.is_device_open());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_load_driver_is_idempotent() {
        let (session, loader) = session();
        session.load_driver().unwrap();
        session.load_driver().unwrap();
        assert!(session.is_driver_loaded());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_failure_maps_to_library_error() {
        let (session, loader) = session();
        loader.fail.store(true, Ordering::SeqCst);

        let err = session.send(&CanFrame::new_extended(1, &[])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LibraryCouldNotBeLoaded);
        assert!(!session.is_driver_loaded());
    }

    #[test]
    fn test_open_device_is_idempotent() {
        let (session, loader) = session();
        let a = session.open_device().unwrap();
        let b = session.open_device().unwrap();
        assert_eq!(a, b);
        assert_eq!(loader.driver.hw.lock().opens, 1);
    }

    #[test]
    fn test_no_device_is_resource_not_available_and_retried() {
        let (session, loader) = session();
        loader.driver.hw.lock().no_device = true;

        let err = session.receive(&mut [CanFrame::default(); 4]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceNotAvailable);

        loader.driver.hw.lock().no_device = false;
        assert_eq!(session.receive(&mut [CanFrame::default(); 4]).unwrap(), 0);
        assert!(session.is_device_open());
    }

    #[test]
    fn test_receive_timeout_is_clean_empty() {
        let (session, _loader) = session();
        let mut out = [CanFrame::default(); 8];
        assert_eq!(session.receive(&mut out).unwrap(), 0);
        assert_eq!(session.queue_len(), 0);
    }

    #[test]
    fn test_send_translates_frame() {
        let (session, loader) = session();
        session
            .send(&CanFrame::new_standard(0x123, &[1, 2, 3]))
            .unwrap();

        let hw = loader.driver.hw.lock();
        assert_eq!(hw.sent.len(), 1);
        let msg = hw.sent[0];
        assert!(msg.status.xtd_frame());
        assert_eq!(msg.network_id, NETID_HSCAN);
        assert_eq!(msg.arb_id, 0x123);
        assert_eq!(&msg.data[..msg.len as usize], &[1, 2, 3]);
    }

    #[test]
    fn test_send_rejected_by_driver_is_general_error() {
        let (session, loader) = session();
        loader.driver.hw.lock().transmit_fails = true;
        let err = session.send(&CanFrame::new_extended(1, &[0])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GeneralError);
    }

    #[test]
    fn test_receive_filters_and_keeps_fifo() {
        let (session, loader) = session();
        {
            let mut hw = loader.driver.hw.lock();
            let mut echo = rx_message(0x2, &[0]);
            echo.status.set_tx_msg(true);
            let mut bus_error = rx_message(0x3, &[0]);
            bus_error.status.set_global_err(true);
            let mut other_net = rx_message(0x4, &[0]);
            other_net.network_id = 5;

            hw.pending = vec![
                rx_message(0x1, &[0xA]),
                echo,
                bus_error,
                other_net,
                rx_message(0x5, &[0xB]),
                rx_message(0x6, &[0xC]),
            ];
        }

        let mut out = [CanFrame::default(); 2];
        assert_eq!(session.receive(&mut out).unwrap(), 2);
        assert_eq!(out[0].arb_id(), 0x1);
        assert_eq!(out[1].arb_id(), 0x5);
        assert!(out[0].is_extended());
        assert_eq!(session.queue_len(), 1);

        // 剩余的帧留在队列里，下一次（等待超时）取出
        assert_eq!(session.receive(&mut out).unwrap(), 1);
        assert_eq!(out[0].arb_id(), 0x6);
        assert_eq!(out[0].data_slice(), &[0xC]);
    }

    #[test]
    fn test_link_drop_closes_and_flushes_then_reopens() {
        let (session, loader) = session();
        loader.driver.hw.lock().pending = (0..5).map(|i| rx_message(i, &[i as u8])).collect();

        let mut out = [CanFrame::default(); 1];
        assert_eq!(session.receive(&mut out).unwrap(), 1);
        assert_eq!(session.queue_len(), 4);

        {
            let mut hw = loader.driver.hw.lock();
            hw.waits.push_back(RxWait::Failed);
            hw.last_error = Some(NEOVI_ERROR_NO_RESPONSE);
        }
        assert_eq!(session.receive(&mut out).unwrap(), 0);
        assert!(!session.is_device_open());
        assert_eq!(session.queue_len(), 0);
        assert_eq!(loader.driver.hw.lock().closes, 1);

        loader.driver.hw.lock().last_error = None;
        assert_eq!(session.receive(&mut out).unwrap(), 0);
        assert!(session.is_device_open());
        assert_eq!(loader.driver.hw.lock().opens, 2);
    }

    #[test]
    fn test_other_vendor_error_keeps_device_open() {
        let (session, loader) = session();
        {
            let mut hw = loader.driver.hw.lock();
            hw.waits.push_back(RxWait::Failed);
            hw.last_error = Some(12);
        }
        assert_eq!(session.receive(&mut [CanFrame::default(); 1]).unwrap(), 0);
        assert!(session.is_device_open());
        assert_eq!(loader.driver.hw.lock().closes, 0);
    }

    #[test]
    fn test_queue_overflow_drops_rest_of_batch() {
        let (session, loader) = session_with(SessionConfig {
            rx_queue_capacity: 4,
            ..Default::default()
        });
        loader.driver.hw.lock().pending = (0..6).map(|i| rx_message(i, &[])).collect();

        assert_eq!(session.receive(&mut []).unwrap(), 0);
        assert_eq!(session.queue_len(), 4);
        assert_eq!(session.overflow_count(), 1);

        let mut out = [CanFrame::default(); 10];
        assert_eq!(session.receive(&mut out).unwrap(), 4);
        assert_eq!(
            out[..4].iter().map(|f| f.arb_id()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_full_queue_keeps_draining_on_busy_bus() {
        let (session, loader) = session_with(SessionConfig {
            rx_queue_capacity: 4,
            ..Default::default()
        });

        let mut delivered = Vec::new();
        for round in 0..5u32 {
            loader.driver.hw.lock().pending =
                (0..3).map(|i| rx_message(round * 10 + i, &[])).collect();
            let mut out = [CanFrame::default(); 1];
            assert_eq!(session.receive(&mut out).unwrap(), 1);
            delivered.push(out[0].arb_id());
            assert!(session.queue_len() <= 4);
        }

        // 队列满后新批次被丢弃，旧帧按到达顺序持续取出
        assert_eq!(delivered, vec![0, 1, 2, 10, 11]);
        assert_eq!(session.overflow_count(), 4);

        loader.driver.hw.lock().pending.clear();
        let mut out = [CanFrame::default(); 8];
        assert_eq!(session.receive(&mut out).unwrap(), 3);
        assert_eq!(
            out[..3].iter().map(|f| f.arb_id()).collect::<Vec<_>>(),
            vec![20, 30, 40]
        );
        assert_eq!(session.queue_len(), 0);
    }

    #[test]
    fn test_dispose_twice_touches_hardware_once() {
        let (session, loader) = session();
        session.open_device().unwrap();

        session.dispose();
        assert_eq!(session.state(), SessionState::Disposed);
        let calls = loader.driver.hw.lock().calls;
        assert_eq!(loader.driver.hw.lock().closes, 1);

        session.dispose();
        assert_eq!(loader.driver.hw.lock().calls, calls);
        assert_eq!(loader.driver.hw.lock().closes, 1);
    }

    #[test]
    fn test_operations_after_dispose_fail() {
        let (session, loader) = session();
        session.dispose();

        for _ in 0..3 {
            let err = session.send(&CanFrame::new_extended(1, &[])).unwrap_err();
            assert_eq!(err.code(), ErrorCode::GeneralError);
            let err = session.receive(&mut [CanFrame::default(); 1]).unwrap_err();
            assert_eq!(err.code(), ErrorCode::GeneralError);
            assert!(session.open_device().is_err());
            assert!(session.load_driver().is_err());
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_device_forces_when_lock_busy() {
        let (session, loader) = session();
        session.open_device().unwrap();

        let guard = session.lifecycle.lock();
        session.close_device().unwrap();
        drop(guard);

        assert!(!session.is_device_open());
        assert_eq!(loader.driver.hw.lock().closes, 1);

        // 句柄已清空，再次关闭不访问硬件
        session.close_device().unwrap();
        assert_eq!(loader.driver.hw.lock().closes, 1);
    }

    #[test]
    fn test_drop_disposes_session() {
        let (session, loader) = session();
        session.open_device().unwrap();
        drop(session);
        assert_eq!(loader.driver.hw.lock().closes, 1);
    }

    #[test]
    fn test_concurrent_receive_and_dispose() {
        let (session, loader) = session();
        let session = Arc::new(session);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                thread::spawn(move || {
                    let mut out = [CanFrame::default(); 4];
                    for _ in 0..20 {
                        if session.receive(&mut out).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(5));
        session.dispose();
        for r in readers {
            r.join().unwrap();
        }

        assert_eq!(session.state(), SessionState::Disposed);
        assert!(!session.is_device_open());
        let hw = loader.driver.hw.lock();
        assert!(hw.closes <= hw.opens);
        assert!(hw.opens <= 1);
    }
}
