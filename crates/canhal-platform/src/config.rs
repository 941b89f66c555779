//! 平台配置
//!
//! TOML 格式，缺省的键取默认值：
//!
//! ```toml
//! backend = "simulation"        # simulation | socketcan | hardware
//! interface = "vcan0"           # 仅 socketcan，start() 时绑定
//! staging_dir = "/tmp"
//! vendor_library = "/opt/ics/libicsneo40.so"
//! poll_timeout_ms = 100
//! close_timeout_ms = 500
//! rx_queue_capacity = 1000
//! max_devices = 10
//!
//! [module_paths]
//! talon_srx = "/opt/sim/libtalon.so"
//!
//! [entry_points]
//! start = "Start"
//! send = "SendFrame"
//! receive = "ReceiveFrame"
//! ```

use crate::PlatformError;
use canhal_can::loader::EntryPoints;
use canhal_can::{DeviceType, LoaderConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(target_os = "linux")]
use canhal_can::SocketCanConfig;

/// 传输类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 动态加载的仿真模块
    #[default]
    Simulation,
    /// Linux SocketCAN
    SocketCan,
    /// 厂商 USB 适配器
    Hardware,
}

/// 后端模块入口符号名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryPointsConfig {
    pub start: String,
    pub send: String,
    pub receive: String,
}

impl Default for EntryPointsConfig {
    fn default() -> Self {
        let defaults = EntryPoints::default();
        Self {
            start: defaults.start,
            send: defaults.send,
            receive: defaults.receive,
        }
    }
}

impl From<EntryPointsConfig> for EntryPoints {
    fn from(config: EntryPointsConfig) -> Self {
        Self {
            start: config.start,
            send: config.send,
            receive: config.receive,
        }
    }
}

/// 平台配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    pub backend: BackendKind,
    /// SocketCAN 接口，`start()` 时绑定
    pub interface: Option<String>,
    /// 仿真模块暂存目录
    pub staging_dir: PathBuf,
    /// 设备类型名 -> 模块路径，优先于环境变量
    pub module_paths: BTreeMap<String, PathBuf>,
    pub entry_points: EntryPointsConfig,
    /// 厂商驱动库名或路径；缺省按平台命名查找 icsneo40
    pub vendor_library: Option<String>,
    pub poll_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub rx_queue_capacity: usize,
    pub max_devices: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            interface: None,
            staging_dir: std::env::temp_dir(),
            module_paths: BTreeMap::new(),
            entry_points: EntryPointsConfig::default(),
            vendor_library: None,
            poll_timeout_ms: 100,
            close_timeout_ms: 500,
            rx_queue_capacity: 1000,
            max_devices: 10,
        }
    }
}

impl PlatformConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, PlatformError> {
        let config: PlatformConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PlatformError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| PlatformError::ConfigIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, PlatformError> {
        toml::to_string(self).map_err(|e| PlatformError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.rx_queue_capacity == 0 {
            return Err(PlatformError::InvalidConfig(
                "rx_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_devices == 0 {
            return Err(PlatformError::InvalidConfig(
                "max_devices must be greater than 0".to_string(),
            ));
        }
        if self.poll_timeout_ms > u16::MAX as u64 {
            return Err(PlatformError::InvalidConfig(format!(
                "poll_timeout_ms must be at most {}",
                u16::MAX
            )));
        }
        let entry = &self.entry_points;
        if entry.start.is_empty() || entry.send.is_empty() || entry.receive.is_empty() {
            return Err(PlatformError::InvalidConfig(
                "entry point names must not be empty".to_string(),
            ));
        }
        self.parsed_module_paths().map(|_| ())
    }

    fn parsed_module_paths(&self) -> Result<HashMap<DeviceType, PathBuf>, PlatformError> {
        self.module_paths
            .iter()
            .map(|(name, path)| {
                let device = name.parse::<DeviceType>().map_err(|_| {
                    PlatformError::InvalidConfig(format!("unknown device type '{}' in module_paths", name))
                })?;
                Ok((device, path.clone()))
            })
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn loader_config(&self) -> Result<LoaderConfig, PlatformError> {
        Ok(LoaderConfig {
            staging_dir: self.staging_dir.clone(),
            module_paths: self.parsed_module_paths()?,
            entry_points: self.entry_points.clone().into(),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_timeout: self.poll_timeout(),
            close_timeout: self.close_timeout(),
            rx_queue_capacity: self.rx_queue_capacity,
            max_devices: self.max_devices,
        }
    }

    #[cfg(target_os = "linux")]
    pub fn socketcan_config(&self) -> SocketCanConfig {
        SocketCanConfig {
            poll_timeout: self.poll_timeout(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PlatformConfig::default();
        assert_eq!(config.backend, BackendKind::Simulation);
        assert_eq!(config.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.close_timeout(), Duration::from_millis(500));
        assert_eq!(config.rx_queue_capacity, 1000);
        assert_eq!(config.max_devices, 10);
        assert_eq!(config.entry_points.send, "SendFrame");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = PlatformConfig::from_toml_str("").unwrap();
        assert_eq!(config, PlatformConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = PlatformConfig::from_toml_str(
            r#"
backend = "hardware"
vendor_library = "/opt/ics/libicsneo40.so"
poll_timeout_ms = 20
rx_queue_capacity = 64

[module_paths]
talon_srx = "/opt/sim/libtalon.so"
PigeonIMU = "/opt/sim/libpigeon.so"

[entry_points]
start = "SimStart"
"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Hardware);
        assert_eq!(config.vendor_library.as_deref(), Some("/opt/ics/libicsneo40.so"));
        assert_eq!(config.entry_points.start, "SimStart");
        assert_eq!(config.entry_points.receive, "ReceiveFrame");

        let loader = config.loader_config().unwrap();
        assert_eq!(
            loader.module_paths.get(&DeviceType::TalonSrx),
            Some(&PathBuf::from("/opt/sim/libtalon.so"))
        );
        assert!(loader.module_paths.contains_key(&DeviceType::PigeonImu));
        assert_eq!(loader.entry_points.start, "SimStart");

        let session = config.session_config();
        assert_eq!(session.poll_timeout, Duration::from_millis(20));
        assert_eq!(session.rx_queue_capacity, 64);
        assert_eq!(session.max_devices, 10);
    }

    #[test]
    fn test_backend_kind_names() {
        for (name, kind) in [
            ("simulation", BackendKind::Simulation),
            ("socketcan", BackendKind::SocketCan),
            ("hardware", BackendKind::Hardware),
        ] {
            let config = PlatformConfig::from_toml_str(&format!("backend = \"{}\"", name)).unwrap();
            assert_eq!(config.backend, kind);
        }
        assert!(PlatformConfig::from_toml_str("backend = \"gs_usb\"").is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for content in [
            "rx_queue_capacity = 0",
            "max_devices = 0",
            "poll_timeout_ms = 100000",
            "[entry_points]\nsend = \"\"",
            "[module_paths]\nfalcon = \"/x.so\"",
            "unknown_key = 1",
        ] {
            let err = PlatformConfig::from_toml_str(content).unwrap_err();
            assert_eq!(
                err.code(),
                canhal_can::ErrorCode::InvalidParamValue,
                "content: {}",
                content
            );
        }
    }

    #[test]
    fn test_load_from_file_and_roundtrip() {
        let mut config = PlatformConfig {
            backend: BackendKind::SocketCan,
            interface: Some("vcan0".into()),
            ..Default::default()
        };
        config
            .module_paths
            .insert("victor_spx".into(), PathBuf::from("/opt/sim/libvictor.so"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = PlatformConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = PlatformConfig::load("/nonexistent/canhal.toml").unwrap_err();
        assert!(matches!(err, PlatformError::ConfigIo { .. }));
    }
}
