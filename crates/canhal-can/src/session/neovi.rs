//! neoVI 厂商库（icsneo40）绑定
//!
//! 通过 `libloading` 在运行时加载，所有符号在加载时一次性解析。
//! 结构体布局与厂商头文件一致（`#[repr(C)]`）。

use super::vendor::{DeviceHandle, RxWait, SpyStatus, VendorDriver, VendorLoader, VendorMessage};
use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use libloading::Library;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString, c_void};
use std::os::raw::{c_int, c_uint, c_ulong};
use std::ptr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 驱动单次可返回的最大消息数
pub const RX_CACHE_SIZE: usize = 20_000;

/// 枚举所有设备类型
const NEODEVICE_ALL: c_ulong = 0xFFFF_BFFF;

/// `icsSpyMessage`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SpyMessage {
    pub status_bitfield: u32,
    pub status_bitfield2: u32,
    pub time_hardware: u32,
    pub time_hardware2: u32,
    pub time_system: u32,
    pub time_system2: u32,
    pub time_stamp_hardware_id: u8,
    pub time_stamp_system_id: u8,
    pub network_id: u8,
    pub node_id: u8,
    pub protocol: u8,
    pub message_piece_id: u8,
    pub extra_data_ptr_enabled: u8,
    pub number_bytes_header: u8,
    pub number_bytes_data: u8,
    pub network_id2: u8,
    pub description_id: i16,
    pub arb_id_or_header: i32,
    pub data: [u8; 8],
    pub ack_bytes: [u8; 8],
    /// 原始类型为 `void*`；不解引用，按整数保存
    pub extra_data_ptr: usize,
    pub misc_data: u8,
    pub reserved: [u8; 3],
}

impl From<&SpyMessage> for VendorMessage {
    fn from(msg: &SpyMessage) -> Self {
        Self {
            status: SpyStatus::from_raw(msg.status_bitfield),
            network_id: msg.network_id,
            arb_id: msg.arb_id_or_header as u32,
            data: msg.data,
            len: msg.number_bytes_data,
        }
    }
}

impl From<&VendorMessage> for SpyMessage {
    fn from(msg: &VendorMessage) -> Self {
        Self {
            status_bitfield: msg.status.to_raw(),
            network_id: msg.network_id,
            arb_id_or_header: msg.arb_id as i32,
            data: msg.data,
            number_bytes_data: msg.len,
            ..Default::default()
        }
    }
}

/// `NeoDevice`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NeoDevice {
    pub device_type: c_int,
    pub handle: c_int,
    pub number_of_clients: c_int,
    pub serial_number: c_int,
    pub max_allowed_clients: c_int,
}

type FindNeoDevicesFn =
    unsafe extern "C" fn(device_types: c_ulong, devices: *mut NeoDevice, count: *mut c_int) -> c_int;
type OpenNeoDeviceFn = unsafe extern "C" fn(
    device: *mut NeoDevice,
    handle: *mut *mut c_void,
    network_ids: *mut u8,
    config_read: c_int,
    sync_to_pc: c_int,
) -> c_int;
type ClosePortFn = unsafe extern "C" fn(handle: *mut c_void, errors: *mut c_int) -> c_int;
type TxMessagesFn = unsafe extern "C" fn(
    handle: *mut c_void,
    messages: *mut SpyMessage,
    network_id: c_int,
    count: c_int,
) -> c_int;
type WaitForRxFn = unsafe extern "C" fn(handle: *mut c_void, timeout_ms: c_uint) -> c_int;
type GetMessagesFn = unsafe extern "C" fn(
    handle: *mut c_void,
    messages: *mut SpyMessage,
    count: *mut c_int,
    errors: *mut c_int,
) -> c_int;
type GetLastApiErrorFn = unsafe extern "C" fn(handle: *mut c_void, error: *mut c_ulong) -> c_int;

/// 加载 icsneo40
#[derive(Debug, Clone)]
pub struct NeoViLoader {
    library: OsString,
}

impl NeoViLoader {
    /// `library` 可以是库名（交给系统搜索路径）或完整路径
    pub fn new(library: impl AsRef<OsStr>) -> Self {
        Self {
            library: library.as_ref().to_os_string(),
        }
    }
}

impl Default for NeoViLoader {
    fn default() -> Self {
        Self::new(libloading::library_filename("icsneo40"))
    }
}

impl VendorLoader for NeoViLoader {
    type Driver = NeoViDriver;

    fn load(&self) -> Result<NeoViDriver, CanError> {
        let name = self.library.to_string_lossy().to_string();
        // SAFETY: 厂商驱动库，初始化代码由厂商负责
        let library = unsafe { Library::new(&self.library) }
            .map_err(|e| CanError::LibraryNotLoaded(format!("{}: {}", name, e)))?;

        let driver = NeoViDriver {
            find: symbol(&library, "icsneoFindNeoDevices")?,
            open: symbol(&library, "icsneoOpenNeoDevice")?,
            close: symbol(&library, "icsneoClosePort")?,
            tx: symbol(&library, "icsneoTxMessages")?,
            wait: symbol(&library, "icsneoWaitForRxMessagesWithTimeOut")?,
            get: symbol(&library, "icsneoGetMessages")?,
            last_error: symbol(&library, "icsneoGetLastAPIError")?,
            rx_cache: Mutex::new(vec![SpyMessage::default(); RX_CACHE_SIZE]),
            _library: library,
        };
        debug!("Loaded vendor driver {}", name);
        Ok(driver)
    }
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, CanError> {
    // SAFETY: 函数签名与厂商头文件一致；指针有效期由 NeoViDriver 持有的 Library 保证
    unsafe {
        library
            .get::<T>(name.as_bytes())
            .map(|s| *s)
            .map_err(|e| CanError::LibraryNotLoaded(format!("{}: {}", name, e)))
    }
}

/// 已加载的 icsneo40
pub struct NeoViDriver {
    find: FindNeoDevicesFn,
    open: OpenNeoDeviceFn,
    close: ClosePortFn,
    tx: TxMessagesFn,
    wait: WaitForRxFn,
    get: GetMessagesFn,
    last_error: GetLastApiErrorFn,
    /// 取消息用的缓冲区，驱动一次最多写入 RX_CACHE_SIZE 条
    rx_cache: Mutex<Vec<SpyMessage>>,
    _library: Library,
}

fn as_ptr(handle: DeviceHandle) -> *mut c_void {
    handle.raw() as *mut c_void
}

fn tx_result(rc: c_int) -> Result<(), CanError> {
    // 驱动返回 1 表示消息被接受
    if rc == 1 {
        Ok(())
    } else {
        Err(CanError::Transmit(format!("icsneoTxMessages returned {}", rc)))
    }
}

fn wait_result(rc: c_int) -> RxWait {
    match rc {
        n if n > 0 => RxWait::Ready,
        0 => RxWait::Timeout,
        _ => RxWait::Failed,
    }
}

impl VendorDriver for NeoViDriver {
    fn open_first(&self, max_devices: usize) -> Result<Option<DeviceHandle>, CanError> {
        if max_devices == 0 {
            return Ok(None);
        }
        let mut devices = vec![NeoDevice::default(); max_devices];
        let mut count = max_devices as c_int;

        let found = unsafe { (self.find)(NEODEVICE_ALL, devices.as_mut_ptr(), &mut count) };
        if found == 0 || count <= 0 {
            trace!("No neoVI device found");
            return Ok(None);
        }
        trace!("Found {} neoVI device(s)", count);

        let mut raw: *mut c_void = ptr::null_mut();
        let opened = unsafe { (self.open)(&mut devices[0], &mut raw, ptr::null_mut(), 1, 0) };
        if opened == 0 {
            warn!(
                "icsneoOpenNeoDevice failed for serial {}",
                devices[0].serial_number
            );
            return Ok(None);
        }

        let handle = DeviceHandle::new(raw as usize);
        if handle.is_some() {
            debug!("Opened neoVI device, serial {}", devices[0].serial_number);
        }
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) -> Result<(), CanError> {
        let mut errors: c_int = 0;
        let rc = unsafe { (self.close)(as_ptr(handle), &mut errors) };
        if rc == 0 {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::Backend,
                format!("icsneoClosePort failed ({} pending errors)", errors),
            )));
        }
        Ok(())
    }

    fn transmit(&self, handle: DeviceHandle, message: &VendorMessage) -> Result<(), CanError> {
        let mut spy = SpyMessage::from(message);
        let rc = unsafe { (self.tx)(as_ptr(handle), &mut spy, message.network_id as c_int, 1) };
        tx_result(rc)
    }

    fn wait_for_rx(&self, handle: DeviceHandle, timeout: Duration) -> RxWait {
        let timeout_ms = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
        let rc = unsafe { (self.wait)(as_ptr(handle), timeout_ms) };
        wait_result(rc)
    }

    fn fetch_messages(&self, handle: DeviceHandle) -> Result<Vec<VendorMessage>, CanError> {
        let mut cache = self.rx_cache.lock();
        let mut count: c_int = 0;
        let mut errors: c_int = 0;

        let rc = unsafe { (self.get)(as_ptr(handle), cache.as_mut_ptr(), &mut count, &mut errors) };
        if rc == 0 {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::Backend,
                "icsneoGetMessages failed",
            )));
        }

        let count = (count.max(0) as usize).min(cache.len());
        Ok(cache[..count].iter().map(VendorMessage::from).collect())
    }

    fn last_api_error(&self, handle: DeviceHandle) -> Option<u32> {
        let mut code: c_ulong = 0;
        let rc = unsafe { (self.last_error)(as_ptr(handle), &mut code) };
        (rc != 0).then_some(code as u32)
    }
}
