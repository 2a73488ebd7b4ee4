//! # Spot Protocol
//!
//! 服务端与网页客户端之间的线上数据类型（无机器人依赖）
//!
//! ## 模块
//!
//! - `command`: 队列/程序中的命令记录及其动作解码
//! - `notification`: 服务端推送给客户端的通知（类型标签 + 负载 + 严重级别）
//! - `message`: 客户端通过推送通道发来的消息（按 `action` 标签区分）

pub mod command;
pub mod message;
pub mod notification;

pub use command::{Action, Command, EulerDegrees, LocomotionHint};
pub use message::{ClientMessage, DISCONNECTED_SENTINEL, Inbound};
pub use notification::{CameraFeed, Notification, NotificationKind, Severity};

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 命令缺少必需参数
    #[error("Missing argument `{arg}` for command `{action}`")]
    MissingArgument { action: String, arg: &'static str },

    /// 命令参数无法解析
    #[error("Invalid argument `{arg}` for command `{action}`: {reason}")]
    InvalidArgument {
        action: String,
        arg: &'static str,
        reason: String,
    },

    /// 未知的步态提示
    #[error("Unknown locomotion hint: {0}")]
    UnknownLocomotionHint(String),

    /// JSON 格式错误或未知的消息类型
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}
