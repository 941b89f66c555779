//! 后端模块能力接口与动态加载实现
//!
//! 上层只看到 [`BackendModule`]（Start / Send / Receive 三个能力），
//! 符号解析全部封装在 [`DylibLoader`] 内部，不对调用方暴露。

use crate::{CanError, CanFrame, FrameError, FrameFlags};
use canhal_frame::CAN_EFF_MASK;
use libloading::Library;
use std::os::raw::c_int;
use std::path::Path;
use tracing::trace;

/// 单个后端模块的能力集合
pub trait BackendModule: Send {
    /// 模块启动入口，`id` 为设备实例号
    fn start(&mut self, id: i32) -> Result<(), CanError>;

    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CanError>;

    /// `Ok(None)` 表示当前没有帧（干净的空结果）
    fn receive_frame(&mut self) -> Result<Option<CanFrame>, CanError>;
}

/// 平台动态加载抽象
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn BackendModule>, CanError>;
}

/// 模块导出的入口符号名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoints {
    pub start: String,
    pub send: String,
    pub receive: String,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            start: "Start".to_string(),
            send: "SendFrame".to_string(),
            receive: "ReceiveFrame".to_string(),
        }
    }
}

type StartFn = unsafe extern "C" fn(id: c_int) -> i32;
type SendFn = unsafe extern "C" fn(arb_id: u32, data: *const u8, len: u8) -> i32;
type ReceiveFn = unsafe extern "C" fn(arb_id: *mut u32, data: *mut u8, len: *mut u8) -> i32;

/// 基于 `libloading` 的加载器
#[derive(Debug, Clone, Default)]
pub struct DylibLoader {
    entry_points: EntryPoints,
}

impl DylibLoader {
    pub fn new(entry_points: EntryPoints) -> Self {
        Self { entry_points }
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn BackendModule>, CanError> {
        // SAFETY: 加载的是调用方通过环境变量/配置指定的后端模块，
        // 其初始化代码由模块作者负责
        let library = unsafe { Library::new(path) }
            .map_err(|e| CanError::ModuleLoad(format!("{}: {}", path.display(), e)))?;

        // 入口全部在加载时解析，缺任何一个都视为模块无效
        let start = resolve::<StartFn>(&library, &self.entry_points.start)?;
        let send = resolve::<SendFn>(&library, &self.entry_points.send)?;
        let receive = resolve::<ReceiveFn>(&library, &self.entry_points.receive)?;

        trace!("Loaded backend module from {}", path.display());
        Ok(Box::new(DylibModule {
            entry: EntryFns::new(start, send, receive),
            _library: library,
        }))
    }
}

fn resolve<T: Copy>(library: &Library, name: &str) -> Result<T, CanError> {
    // SAFETY: 符号类型与模块 ABI 约定一致；函数指针的生命周期由
    // DylibModule 持有的 Library 保证
    unsafe {
        library
            .get::<T>(name.as_bytes())
            .map(|symbol| *symbol)
            .map_err(|e| CanError::ModuleLoad(format!("missing entry point '{}': {}", name, e)))
    }
}

/// 三个入口函数指针到 [`BackendModule`] 的翻译
///
/// 不持有动态库；调用方保证函数指针在使用期间有效。
#[derive(Clone, Copy)]
struct EntryFns {
    start: StartFn,
    send: SendFn,
    receive: ReceiveFn,
}

impl EntryFns {
    fn new(start: StartFn, send: SendFn, receive: ReceiveFn) -> Self {
        Self {
            start,
            send,
            receive,
        }
    }
}

impl BackendModule for EntryFns {
    fn start(&mut self, id: i32) -> Result<(), CanError> {
        let status = unsafe { (self.start)(id as c_int) };
        status_to_result(status)
    }

    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        let status = unsafe { (self.send)(frame.arb_id(), frame.data().as_ptr(), frame.dlc()) };
        status_to_result(status)
    }

    /// 非零状态表示该模块本次没有帧，状态原样上报
    fn receive_frame(&mut self) -> Result<Option<CanFrame>, CanError> {
        let mut arb_id = 0u32;
        let mut data = [0u8; 8];
        let mut len = 0u8;

        let status = unsafe { (self.receive)(&mut arb_id, data.as_mut_ptr(), &mut len) };
        status_to_result(status)?;

        if len as usize > data.len() {
            return Err(CanError::Frame(FrameError::InvalidDlc { dlc: len }));
        }
        let mut flags = FrameFlags::default();
        flags.set_extended(true);
        let frame = CanFrame::try_new(arb_id & CAN_EFF_MASK, &data[..len as usize], flags)?;
        Ok(Some(frame))
    }
}

/// 已加载的模块；析构时卸载动态库
struct DylibModule {
    entry: EntryFns,
    _library: Library,
}

impl BackendModule for DylibModule {
    fn start(&mut self, id: i32) -> Result<(), CanError> {
        self.entry.start(id)
    }

    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        self.entry.send_frame(frame)
    }

    fn receive_frame(&mut self) -> Result<Option<CanFrame>, CanError> {
        self.entry.receive_frame()
    }
}

fn status_to_result(status: i32) -> Result<(), CanError> {
    if status == 0 {
        Ok(())
    } else {
        Err(CanError::Backend { status })
    }
}
