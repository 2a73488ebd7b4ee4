//! 服务端推送的通知
//!
//! 线上格式：`{"type": "<kind>", "output": <payload>, "severity": "<level>"}`，
//! 其中 `severity` 仅在人类可读消息上出现。`socket_create` 是唯一的例外，
//! 负载放在 `socket_index` 字段中。

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// 摄像头画面标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraFeed {
    /// 左右前置鱼眼拼接后的画面
    Front,
    FrontRight,
    FrontLeft,
    Back,
}

impl CameraFeed {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Front => "@front",
            Self::FrontRight => "@front_right",
            Self::FrontLeft => "@front_left",
            Self::Back => "@back",
        }
    }
}

/// 通知类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// 人类可读的输出消息
    Output,
    /// 新连接分配的客户端编号
    SocketCreate,
    /// 主循环启动/结束
    BgProcess,
    /// 机器人连接建立/断开
    RobotToggle,
    /// 急停权限获取/清除
    EstopToggle,
    /// 租约获取/清除
    LeaseToggle,
    /// 急停触发/解除
    Estop,
    /// 命令队列当前内容
    CommandQueue,
    /// 程序表当前内容
    Programs,
    ToggleAcceptCommand,
    ToggleAutoRun,
    /// 键盘控制模式（Walk / Stand）
    ControlMode,
    BatteryPercentage,
    BatteryRuntime,
    ServerState,
    Image(CameraFeed),
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::SocketCreate => "socket_create",
            Self::BgProcess => "bg_process",
            Self::RobotToggle => "robot_toggle",
            Self::EstopToggle => "estop_toggle",
            Self::LeaseToggle => "lease_toggle",
            Self::Estop => "estop",
            Self::CommandQueue => "command_queue",
            Self::Programs => "programs",
            Self::ToggleAcceptCommand => "toggle_accept_command",
            Self::ToggleAutoRun => "toggle_auto_run",
            Self::ControlMode => "control_mode",
            Self::BatteryPercentage => "battery_percentage",
            Self::BatteryRuntime => "battery_runtime",
            Self::ServerState => "server_state",
            Self::Image(feed) => feed.as_str(),
        }
    }
}

/// 消息严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// 一条推送通知
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub payload: Value,
    pub severity: Option<Severity>,
}

impl Notification {
    /// 状态类事件（无严重级别）
    pub fn event(kind: NotificationKind, payload: impl Into<Value>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            severity: None,
        }
    }

    /// 人类可读消息
    pub fn message(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Output,
            payload: Value::String(text.into()),
            severity: Some(severity),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::message(Severity::Info, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::message(Severity::Success, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::message(Severity::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::message(Severity::Error, text)
    }

    /// 负载中的文本（仅对字符串负载有效）
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// 序列化为一行 JSON
    pub fn to_json(&self) -> String {
        // Value 与 &'static str 的序列化不会失败
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.severity.is_some() { 3 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        let payload_key = match self.kind {
            NotificationKind::SocketCreate => "socket_index",
            _ => "output",
        };
        map.serialize_entry("type", self.kind.as_str())?;
        map.serialize_entry(payload_key, &self.payload)?;
        if let Some(severity) = self.severity {
            map.serialize_entry("severity", severity.as_str())?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let n = Notification::error("Failed to acquire lease");
        let value: Value = serde_json::from_str(&n.to_json()).unwrap();
        assert_eq!(
            value,
            json!({"type": "output", "output": "Failed to acquire lease", "severity": "error"})
        );
    }

    #[test]
    fn test_event_has_no_severity() {
        let n = Notification::event(NotificationKind::LeaseToggle, "acquire");
        let value: Value = serde_json::from_str(&n.to_json()).unwrap();
        assert_eq!(value, json!({"type": "lease_toggle", "output": "acquire"}));
    }

    #[test]
    fn test_socket_create_uses_socket_index_key() {
        let n = Notification::event(NotificationKind::SocketCreate, 2);
        let value: Value = serde_json::from_str(&n.to_json()).unwrap();
        assert_eq!(value, json!({"type": "socket_create", "socket_index": 2}));
    }

    #[test]
    fn test_image_kind_tag() {
        let n = Notification::event(NotificationKind::Image(CameraFeed::Back), "AAAA");
        assert_eq!(n.kind.as_str(), "@back");
        assert!(n.to_json().contains("\"@back\""));
    }

    #[test]
    fn test_text_accessor() {
        assert_eq!(Notification::info("Powered On").text(), Some("Powered On"));
        assert_eq!(
            Notification::event(NotificationKind::ToggleAutoRun, true).text(),
            None
        );
    }
}
