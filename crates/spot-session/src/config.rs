//! 会话配置
//!
//! 从 TOML 文件加载，所有字段都有默认值，缺失的文件等价于全部使用默认值。
//!
//! ```toml
//! [robot]
//! address = "192.168.80.3"
//! username = "user"
//! password = "password"
//!
//! [defaults]
//! accept_commands = true
//! auto_run = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 配置加载错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 负数、NaN 或溢出的秒数按 0 处理
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub robot: RobotConfig,
    pub authority: AuthorityConfig,
    pub defaults: DefaultsConfig,
    pub keyboard: KeyboardConfig,
    pub video: VideoConfig,
}

impl SessionConfig {
    /// 从文件加载配置（文件不存在时返回默认配置）
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// 机器人连接参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    /// SDK 客户端名称
    pub client_name: String,
    /// 连接前是否先 ping 机器人（需要 root 权限，否则视为可达）
    pub probe_reachability: bool,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            address: "192.168.80.3".to_string(),
            username: String::new(),
            password: String::new(),
            client_name: "cc-server".to_string(),
            probe_reachability: true,
        }
    }
}

/// 急停与租约参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// 急停端点名称
    pub estop_name: String,
    pub estop_timeout_secs: f64,
    /// 上电/断电超时
    pub power_timeout_secs: f64,
    /// 断电确认的轮询间隔
    pub power_poll_interval_ms: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            estop_name: "cc-estop".to_string(),
            estop_timeout_secs: 20.0,
            power_timeout_secs: 20.0,
            power_poll_interval_ms: 100,
        }
    }
}

impl AuthorityConfig {
    pub fn estop_timeout(&self) -> Duration {
        secs(self.estop_timeout_secs)
    }

    pub fn power_timeout(&self) -> Duration {
        secs(self.power_timeout_secs)
    }

    pub fn power_poll_interval(&self) -> Duration {
        Duration::from_millis(self.power_poll_interval_ms)
    }
}

/// 会话标志的初始值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// 是否接受新的队列命令
    pub accept_commands: bool,
    /// 是否自动执行整个队列
    pub auto_run: bool,
    /// 主循环两次迭代之间的空闲间隔
    pub tick_interval_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            accept_commands: true,
            auto_run: false,
            tick_interval_ms: 10,
        }
    }
}

impl DefaultsConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// 键盘控制参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    /// 单次键盘行走命令的持续时间（秒）
    pub command_duration_secs: f64,
    /// 平移速度（m/s）
    pub command_velocity: f64,
    /// 转向速度（rad/s）
    pub turn_velocity: f64,
    /// 每帧姿态增量的缩放系数
    pub rotation_velocity: f64,
    /// 姿态偏移上限（弧度）
    pub roll_limit: f64,
    pub yaw_limit: f64,
    pub pitch_limit: f64,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            command_duration_secs: 0.5,
            command_velocity: 0.5,
            turn_velocity: 0.5,
            rotation_velocity: 0.2,
            roll_limit: 0.4,
            yaw_limit: 0.7805,
            pitch_limit: 0.7805,
        }
    }
}

impl KeyboardConfig {
    pub fn command_duration(&self) -> Duration {
        secs(self.command_duration_secs)
    }
}

/// 视频流参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub enabled: bool,
    /// 两帧之间的间隔
    pub frame_interval_ms: u64,
    pub front_right_source: String,
    pub front_left_source: String,
    pub back_source: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_interval_ms: 100,
            front_right_source: "frontright_fisheye_image".to_string(),
            front_left_source: "frontleft_fisheye_image".to_string(),
            back_source: "back_fisheye_image".to_string(),
        }
    }
}

impl VideoConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.robot.client_name, "cc-server");
        assert_eq!(config.authority.estop_name, "cc-estop");
        assert_eq!(config.authority.estop_timeout(), Duration::from_secs(20));
        assert_eq!(config.keyboard.rotation_velocity, 0.2);
        assert_eq!(config.keyboard.roll_limit, 0.4);
        assert_eq!(config.keyboard.command_duration(), Duration::from_millis(500));
        assert_eq!(config.video.back_source, "back_fisheye_image");
    }

    #[test]
    fn test_partial_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            [robot]
            address = "10.0.0.3"
            probe_reachability = false

            [defaults]
            auto_run = true
            "#,
        )
        .unwrap();
        assert_eq!(config.robot.address, "10.0.0.3");
        assert!(!config.robot.probe_reachability);
        assert_eq!(config.robot.client_name, "cc-server");
        assert!(config.defaults.auto_run);
        assert!(config.defaults.accept_commands);
        assert_eq!(config.authority, AuthorityConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let err = SessionConfig::from_toml_str("[robot\naddress = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spot.toml");
        let mut config = SessionConfig::default();
        config.video.enabled = false;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }
}
