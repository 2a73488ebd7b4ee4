//! # Spot Robot SDK Contract
//!
//! 机器人 SDK 抽象层：服务端只依赖这里定义的 trait，具体的厂商 SDK
//! （或测试用的 Mock）在进程启动时注入。
//!
//! # 服务划分
//!
//! ```text
//! RobotSdk ──connect──▶ RobotConnection
//!                         ├── LeaseService ──▶ Lease + LeaseKeepAlive
//!                         ├── EstopService ──▶ EstopEndpoint ──▶ EstopKeepAlive
//!                         ├── TimeSyncService ──▶ TimeSyncHandle
//!                         ├── CommandService (RobotCommand)
//!                         └── ImageService (ImageResponse)
//! ```
//!
//! 所有调用都可能返回 [`SdkError`]，其 [`SdkErrorKind`] 对应厂商 SDK 的异常类型。
//!
//! # Keep-alive 句柄
//!
//! `LeaseKeepAlive` / `EstopKeepAlive` / `TimeSyncHandle` 各自封装了一个后台续约活动，
//! 丢弃之前必须显式调用 `shutdown()` / `stop()`，否则远端注册会一直悬挂。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;

pub mod command;

#[cfg(feature = "mock")]
pub mod mock;

pub use command::{EulerZxy, MobilityParams, ObstacleParams, RobotCommand};

/// 厂商 SDK 异常的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkErrorKind {
    /// 机器人处于急停状态
    Estopped,
    /// 电机上电时无法注册急停端点
    MotorsOn,
    /// 认证失败
    Unauthenticated,
    /// 租约已被其他设备持有
    ResourceAlreadyClaimed,
    /// 未持有执行该操作所需的租约
    NoSuchLease,
    /// 租约不再有效
    NotActiveLease,
    /// 租约使用错误
    LeaseUse,
    /// 网络不可达
    UnableToConnect,
    /// 通用 RPC 错误
    Rpc,
    /// 命令超时
    TimedOut,
    /// 急停端点 ID 无效
    InvalidEstopId,
    /// 急停端点未注册
    EndpointUnknown,
    /// 存在未清除的行为故障
    BehaviorFault,
    /// 相机坐标树校验失败（需要重启机器人）
    FrameTreeInvalid,
    Other,
}

/// SDK 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct SdkError {
    pub kind: SdkErrorKind,
    pub message: String,
}

impl SdkError {
    pub fn new(kind: SdkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is(&self, kind: SdkErrorKind) -> bool {
        self.kind == kind
    }
}

/// 登录凭据
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// 租约令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: String,
    pub epoch: String,
    pub sequence: u64,
}

/// 单张相机图像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResponse {
    /// 图像源名称（如 `frontright_fisheye_image`）
    pub source: String,
    pub rows: u32,
    pub cols: u32,
    /// JPEG 编码的图像数据
    pub data: Vec<u8>,
}

/// 机器人状态（电量相关）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RobotState {
    /// 电量百分比（0-100）
    pub battery_percentage: f64,
    /// 预计剩余运行时间
    pub estimated_runtime: Duration,
}

/// SDK 入口：建立到机器人的已认证连接
pub trait RobotSdk: Send + Sync {
    fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RobotConnection>, SdkError>;
}

/// 已认证的机器人连接
pub trait RobotConnection: Send + Sync {
    fn is_powered_on(&self) -> Result<bool, SdkError>;
    fn is_estopped(&self) -> Result<bool, SdkError>;
    fn power_on(&self, timeout: Duration) -> Result<(), SdkError>;
    fn power_off(&self, cut_immediately: bool, timeout: Duration) -> Result<(), SdkError>;
    fn robot_state(&self) -> Result<RobotState, SdkError>;

    fn lease_service(&self) -> Result<Arc<dyn LeaseService>, SdkError>;
    fn estop_service(&self) -> Result<Arc<dyn EstopService>, SdkError>;
    fn time_sync_service(&self) -> Result<Arc<dyn TimeSyncService>, SdkError>;
    fn command_service(&self) -> Result<Arc<dyn CommandService>, SdkError>;
    fn image_service(&self) -> Result<Arc<dyn ImageService>, SdkError>;
}

pub trait LeaseService: Send + Sync {
    fn acquire(&self) -> Result<Lease, SdkError>;
    fn return_lease(&self, lease: &Lease) -> Result<(), SdkError>;
    /// 启动租约续约活动
    fn keep_alive(&self, lease: &Lease) -> Result<Box<dyn LeaseKeepAlive>, SdkError>;
}

pub trait LeaseKeepAlive: Send {
    fn shutdown(&mut self) -> Result<(), SdkError>;
}

pub trait EstopService: Send + Sync {
    fn create_endpoint(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn EstopEndpoint>, SdkError>;
}

pub trait EstopEndpoint: Send {
    /// 注册为唯一的急停端点（替换已有配置）
    fn force_simple_setup(&mut self) -> Result<(), SdkError>;
    /// 启动急停续约活动（消费端点）
    fn start_keep_alive(self: Box<Self>) -> Result<Box<dyn EstopKeepAlive>, SdkError>;
}

pub trait EstopKeepAlive: Send {
    /// 平缓停止后切断电机电源
    fn settle_then_cut(&mut self) -> Result<(), SdkError>;
    /// 解除急停
    fn allow(&mut self) -> Result<(), SdkError>;
    fn shutdown(&mut self) -> Result<(), SdkError>;
}

pub trait TimeSyncService: Send + Sync {
    /// 启动后台时间同步
    fn start(&self) -> Result<Box<dyn TimeSyncHandle>, SdkError>;
}

pub trait TimeSyncHandle: Send {
    fn stop(&mut self) -> Result<(), SdkError>;
}

pub trait CommandService: Send + Sync {
    /// 发送运动命令（即发即忘），`end_time` 为命令的失效时间
    fn robot_command(
        &self,
        command: &RobotCommand,
        end_time: Option<SystemTime>,
    ) -> Result<(), SdkError>;
}

pub trait ImageService: Send + Sync {
    fn get_image_from_sources(&self, sources: &[&str]) -> Result<Vec<ImageResponse>, SdkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdk_error_display() {
        let err = SdkError::new(SdkErrorKind::ResourceAlreadyClaimed, "body lease held");
        assert_eq!(err.to_string(), "ResourceAlreadyClaimed: body lease held");
        assert!(err.is(SdkErrorKind::ResourceAlreadyClaimed));
        assert!(!err.is(SdkErrorKind::Rpc));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }
}
