//! 会话层错误类型定义
//!
//! 权限与连接失败在发生处被捕获、回滚并转换为「布尔结果 + 通知」；
//! 只有主循环的致命错误（[`SessionError::UnrecoverableLoop`]）会向上传播。

use std::panic::Location;

use spot_protocol::ProtocolError;
use spot_robot::{SdkError, SdkErrorKind};
use spot_store::StoreError;
use thiserror::Error;
use tracing::error;

use crate::notify::{NotificationBus, Target};

/// 会话层错误类型
#[derive(Error, Debug)]
pub enum SessionError {
    /// 急停/租约的获取或释放失败
    #[error("Authority failure during {operation}: {source}")]
    Authority {
        operation: &'static str,
        #[source]
        source: SdkError,
    },

    /// 连接、认证或时间同步失败
    #[error("Connection failure during {operation}: {source}")]
    Connection {
        operation: &'static str,
        #[source]
        source: SdkError,
    },

    /// 单条命令执行失败
    #[error("Command `{command}` failed: {source}")]
    CommandExecution {
        command: String,
        #[source]
        source: Box<SessionError>,
    },

    /// 程序中的某一步失败（其余步骤被放弃）
    #[error("Program `{program}` aborted at step {step}: {source}")]
    ProgramExecution {
        program: String,
        step: usize,
        #[source]
        source: Box<SessionError>,
    },

    /// 主循环无法继续（例如无法重新上电）
    #[error("Unrecoverable loop failure: {0}")]
    UnrecoverableLoop(String),

    /// 机器人未连接
    #[error("Robot is not connected")]
    NotConnected,

    /// 请求被拒绝（状态不允许）
    #[error("Rejected: {0}")]
    Rejected(String),

    /// 未知的动作名称
    #[error("Command not recognized: {0}")]
    UnknownAction(String),

    /// 厂商 SDK 错误（运动命令）
    #[error("SDK error: {0}")]
    Sdk(#[from] SdkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Program store error: {0}")]
    Store(#[from] StoreError),

    /// 后台线程创建失败
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SessionError {
    pub fn authority(operation: &'static str) -> impl FnOnce(SdkError) -> Self {
        move |source| Self::Authority { operation, source }
    }

    pub fn connection(operation: &'static str) -> impl FnOnce(SdkError) -> Self {
        move |source| Self::Connection { operation, source }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// 最内层的 SDK 错误
    pub fn sdk_error(&self) -> Option<&SdkError> {
        match self {
            Self::Authority { source, .. } | Self::Connection { source, .. } => Some(source),
            Self::Sdk(source) => Some(source),
            Self::CommandExecution { source, .. } | Self::ProgramExecution { source, .. } => {
                source.sdk_error()
            },
            _ => None,
        }
    }

    pub fn sdk_kind(&self) -> Option<SdkErrorKind> {
        self.sdk_error().map(|e| e.kind)
    }

    /// 面向用户的简短消息
    ///
    /// 返回 `None` 表示只记录日志、不通知客户端。
    pub fn user_message(&self) -> Option<String> {
        if let Some(sdk) = self.sdk_error() {
            return sdk_user_message(sdk);
        }
        match self {
            Self::CommandExecution { source, .. } | Self::ProgramExecution { source, .. } => {
                source.user_message()
            },
            Self::Rejected(reason) => Some(reason.clone()),
            other => Some(other.to_string()),
        }
    }
}

fn sdk_user_message(error: &SdkError) -> Option<String> {
    let message = match error.kind {
        SdkErrorKind::ResourceAlreadyClaimed => {
            "A different device may have a lease, or the robot may not be fully turned on."
        },
        SdkErrorKind::UnableToConnect => {
            "Unable to connect to the robot. Is it turned on and connected to the right WiFi?"
        },
        SdkErrorKind::MotorsOn => "Unable to acquire Estop while the motors are turned on.",
        SdkErrorKind::Estopped => "Robot cannot turn on while estopped.",
        SdkErrorKind::NoSuchLease => {
            "Cannot perform this action: no lease for it has been acquired."
        },
        SdkErrorKind::Rpc => "Could not perform this action",
        SdkErrorKind::BehaviorFault => "Robot has uncleared behavior faults!",
        SdkErrorKind::FrameTreeInvalid => "Issue with cameras, robot must be rebooted",
        SdkErrorKind::Unauthenticated => "Invalid robot username or password",
        SdkErrorKind::NotActiveLease
        | SdkErrorKind::InvalidEstopId
        | SdkErrorKind::LeaseUse
        | SdkErrorKind::EndpointUnknown
        | SdkErrorKind::TimedOut => return None,
        SdkErrorKind::Other => return Some(format!("Exception: {}", error.message)),
    };
    Some(message.to_string())
}

/// 记录错误（含调用位置）并按需通知目标客户端
#[track_caller]
pub fn report(bus: &NotificationBus, target: Target, error: &SessionError) {
    let location = Location::caller();
    error!(
        kind = ?error.sdk_kind(),
        location = %format_args!("{}:{}", location.file(), location.line()),
        "{}",
        error
    );
    if let Some(message) = error.user_message() {
        match error {
            SessionError::Rejected(_) => bus.warning(target, message),
            _ => bus.error(target, message),
        }
    }
}
