//! 客户端消息
//!
//! 推送通道上客户端发来的每一帧文本要么是断开哨兵 `Disconnected`，
//! 要么是一个以 `action` 字段区分类型的 JSON 对象。

use serde::Deserialize;

use crate::ProtocolError;
use crate::command::Command;

/// 客户端关闭页面时发送的哨兵文本
pub const DISCONNECTED_SENTINEL: &str = "Disconnected";

/// 客户端消息
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// 页面卸载，结束读取循环
    Unload,

    /// 本帧的按键边沿（按下 / 抬起），每帧都需重新发送
    Keys {
        #[serde(default)]
        keys_down: Vec<String>,
        #[serde(default)]
        keys_up: Vec<String>,
    },

    /// 请求键盘控制权
    KeyboardControlStart,

    /// 释放键盘控制权
    KeyboardControlRelease,

    /// 会话动作（`start`、`end`、`acquire_estop` ...）
    Do {
        name: String,
        #[serde(default)]
        args: Option<String>,
    },

    /// 追加一条命令到命令队列
    Command { command: Command },

    /// 写入（新建或覆盖）一个程序
    SaveProgram { name: String, program: Vec<Command> },

    /// 请求全部程序
    GetPrograms,

    /// 请求服务端状态快照
    GetServerState,
}

/// 一帧入站文本的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Disconnected,
    Message(ClientMessage),
}

impl Inbound {
    /// 解析一帧文本
    ///
    /// 未知的 `action` 会返回 [`ProtocolError::Malformed`]，由调用方决定是否断开连接。
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        if text == DISCONNECTED_SENTINEL {
            return Ok(Self::Disconnected);
        }
        Ok(Self::Message(serde_json::from_str(text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sentinel() {
        assert_eq!(Inbound::parse("Disconnected\n").unwrap(), Inbound::Disconnected);
    }

    #[test]
    fn test_parse_keys() {
        let inbound = Inbound::parse(r#"{"action": "keys", "keys_down": ["w"], "keys_up": ["space"]}"#)
            .unwrap();
        assert_eq!(
            inbound,
            Inbound::Message(ClientMessage::Keys {
                keys_down: vec!["w".to_string()],
                keys_up: vec!["space".to_string()],
            })
        );
    }

    #[test]
    fn test_parse_do_with_args() {
        let inbound = Inbound::parse(r#"{"action": "do", "name": "run_program", "args": "Dance"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message(ClientMessage::Do {
                name: "run_program".to_string(),
                args: Some("Dance".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_command() {
        let inbound =
            Inbound::parse(r#"{"action": "command", "command": {"Command": "sit"}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Message(ClientMessage::Command {
                command: Command::sit()
            })
        );
    }

    #[test]
    fn test_unknown_action_is_error() {
        let err = Inbound::parse(r#"{"action": "teleport"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
