//! 仿真后端加载器
//!
//! 每个 (设备类型, 实例号) 对应一个独立加载的后端模块。模块路径来自配置覆盖项或
//! 设备类型对应的环境变量；加载前先复制到暂存目录下的唯一临时文件，加载完成后
//! 无论成功与否都删除临时文件。
//!
//! 收发在所有已注册后端之间扇出：
//! - 发送：每个后端都尝试，返回第一个失败
//! - 接收：按注册表顺序轮询，第一个给出帧的后端胜出，其余后端本轮不再轮询

mod module;
mod staging;

pub use module::{BackendModule, DylibLoader, EntryPoints, ModuleLoader};

use crate::{CanError, CanFrame, CanTransport, MonotonicClock};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// 可仿真的设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceType {
    TalonSrx,
    VictorSpx,
    Canifier,
    PigeonImu,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::TalonSrx,
        DeviceType::VictorSpx,
        DeviceType::Canifier,
        DeviceType::PigeonImu,
    ];

    /// 指定模块路径的环境变量
    pub fn env_var(self) -> &'static str {
        match self {
            DeviceType::TalonSrx => "CTRE_TALON_LIBRARY_PATH",
            DeviceType::VictorSpx => "CTRE_VICTOR_LIBRARY_PATH",
            DeviceType::Canifier => "CTRE_CANIFIER_LIBRARY_PATH",
            DeviceType::PigeonImu => "CTRE_PIGEON_LIBRARY_PATH",
        }
    }

    /// 暂存文件名前缀
    pub fn staged_stem(self) -> &'static str {
        match self {
            DeviceType::TalonSrx => "TEMPTalonObject",
            DeviceType::VictorSpx => "TEMPVictorObject",
            DeviceType::Canifier => "TEMPCANifierObject",
            DeviceType::PigeonImu => "TEMPPigeonObject",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::TalonSrx => "TalonSRX",
            DeviceType::VictorSpx => "VictorSPX",
            DeviceType::Canifier => "CANifier",
            DeviceType::PigeonImu => "PigeonIMU",
        };
        f.write_str(name)
    }
}

impl FromStr for DeviceType {
    type Err = CanError;

    /// 大小写不敏感，忽略 `_` / `-`（`talon_srx`、`TalonSRX` 均可）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "talonsrx" | "talon" => Ok(DeviceType::TalonSrx),
            "victorspx" | "victor" => Ok(DeviceType::VictorSpx),
            "canifier" => Ok(DeviceType::Canifier),
            "pigeonimu" | "pigeon" => Ok(DeviceType::PigeonImu),
            _ => Err(CanError::Unsupported(format!("device type '{}'", s))),
        }
    }
}

/// 注册表键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendKey {
    pub device: DeviceType,
    pub id: i32,
}

impl BackendKey {
    pub fn new(device: DeviceType, id: i32) -> Self {
        Self { device, id }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device, self.id)
    }
}

/// 加载器配置
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// 暂存目录（默认系统临时目录）
    pub staging_dir: PathBuf,
    /// 按设备类型覆盖模块路径，优先于环境变量
    pub module_paths: HashMap<DeviceType, PathBuf>,
    pub entry_points: EntryPoints,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir(),
            module_paths: HashMap::new(),
            entry_points: EntryPoints::default(),
        }
    }
}

/// 已加载后端；drop 时模块随之卸载
struct BackendHandle {
    key: BackendKey,
    module: Box<dyn BackendModule>,
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        trace!("Backend {} unloaded", self.key);
    }
}

/// 仿真后端注册表
///
/// 整个 create 在注册表锁内完成，同一个键并发创建时只有一个会成功。
pub struct BackendRegistry {
    config: LoaderConfig,
    loader: Arc<dyn ModuleLoader>,
    backends: Mutex<BTreeMap<BackendKey, BackendHandle>>,
    clock: MonotonicClock,
}

impl BackendRegistry {
    /// 使用 `libloading` 加载器
    pub fn new(config: LoaderConfig) -> Self {
        let loader = Arc::new(DylibLoader::new(config.entry_points.clone()));
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: LoaderConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            config,
            loader,
            backends: Mutex::new(BTreeMap::new()),
            clock: MonotonicClock::new(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// 加载、启动并注册一个后端
    pub fn create(&self, device: DeviceType, id: i32) -> Result<(), CanError> {
        let key = BackendKey::new(device, id);
        let mut backends = self.backends.lock();

        if backends.contains_key(&key) {
            warn!("Backend {} already exists", key);
            return Err(CanError::AlreadyExists(key));
        }

        let source = self.resolve_module_path(device)?;
        let prefix = format!("{}{}-", device.staged_stem(), id);
        let staged = staging::stage_module(&source, &self.config.staging_dir, &prefix)?;
        let staged_path = staged.to_path_buf();
        trace!("Staged {} as {}", source.display(), staged_path.display());

        let loaded = self.loader.load(&staged_path);

        // 模块已映射进进程（或加载失败），暂存文件不再需要
        if let Err(e) = staged.close() {
            warn!(
                "Failed to remove staged module {}: {}",
                staged_path.display(),
                e
            );
        }

        let mut module = loaded.inspect_err(|e| warn!("Failed to load backend {}: {}", key, e))?;
        module
            .start(id)
            .inspect_err(|e| warn!("Backend {} failed to start: {}", key, e))?;

        backends.insert(key, BackendHandle { key, module });
        debug!("Backend {} created from {}", key, source.display());
        Ok(())
    }

    /// 卸载一个后端；不存在时返回 `false`（不是错误）
    pub fn destroy(&self, device: DeviceType, id: i32) -> bool {
        let key = BackendKey::new(device, id);
        let removed = self.backends.lock().remove(&key);
        match removed {
            Some(_) => {
                debug!("Backend {} destroyed", key);
                true
            },
            None => {
                trace!("Backend {} not registered, nothing to destroy", key);
                false
            },
        }
    }

    /// 卸载全部后端，返回卸载数量
    pub fn destroy_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.backends.lock());
        let count = drained.len();
        // 在锁外卸载
        drop(drained);
        if count > 0 {
            debug!("Destroyed {} backend(s)", count);
        }
        count
    }

    pub fn contains(&self, device: DeviceType, id: i32) -> bool {
        self.backends.lock().contains_key(&BackendKey::new(device, id))
    }

    pub fn len(&self) -> usize {
        self.backends.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.lock().is_empty()
    }

    /// 当前注册的键（有序）
    pub fn keys(&self) -> Vec<BackendKey> {
        self.backends.lock().keys().copied().collect()
    }

    /// 扇出发送：每个后端都尝试，返回第一个失败
    pub fn send_all(&self, frame: &CanFrame) -> Result<(), CanError> {
        let mut backends = self.backends.lock();
        let mut first_err = None;

        for handle in backends.values_mut() {
            if let Err(e) = handle.module.send_frame(frame) {
                trace!("Backend {} rejected frame 0x{:X}: {}", handle.key, frame.arb_id(), e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 扇出接收：第一个给出帧的后端胜出，最多返回一帧
    pub fn receive_first(&self, out: &mut [CanFrame]) -> Result<usize, CanError> {
        if out.is_empty() {
            return Err(CanError::InvalidParam(
                "receive buffer capacity must be at least 1".to_string(),
            ));
        }

        let mut backends = self.backends.lock();
        let mut first_err = None;

        for handle in backends.values_mut() {
            match handle.module.receive_frame() {
                Ok(Some(frame)) => {
                    out[0] = if frame.timestamp_us() == 0 {
                        frame.with_timestamp(self.clock.now_us())
                    } else {
                        frame
                    };
                    return Ok(1);
                },
                Ok(None) => {},
                Err(e) => {
                    trace!("Backend {} receive failed: {}", handle.key, e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                },
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    fn resolve_module_path(&self, device: DeviceType) -> Result<PathBuf, CanError> {
        if let Some(path) = self.config.module_paths.get(&device) {
            return Ok(path.clone());
        }

        let var = device.env_var();
        match std::env::var_os(var) {
            Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
            _ => {
                warn!("{} not set, cannot load {} backend", var, device);
                Err(CanError::ModulePathUnset { device, var })
            },
        }
    }
}

impl CanTransport for BackendRegistry {
    fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        self.send_all(frame)
    }

    fn receive_frames(&self, out: &mut [CanFrame]) -> Result<usize, CanError> {
        self.receive_first(out)
    }

    fn dispose(&self) {
        self.destroy_all();
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("config", &self.config)
            .field("backends", &self.keys())
            .finish()
    }
}
