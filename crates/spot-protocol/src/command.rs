//! 命令记录与动作解码
//!
//! 网页端（以及 Scratch 积木）发来的命令格式为：
//!
//! ```json
//! {"Command": "rotate", "Args": {"yaw": 10, "roll": 0, "pitch": "5"}}
//! ```
//!
//! 参数既可以是数字也可以是数字字符串。`Command` 保留原始记录（用于广播队列内容
//! 和持久化程序），执行时再通过 [`Command::decode`] 解码为强类型的 [`Action`]。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// `wait` 的最长时长（秒）
pub const MAX_WAIT_SECS: f64 = 600.0;

/// `move` / `move_to` 单个方向的最大平移量（米）
pub const MAX_MOVE_DISTANCE: f64 = 20.0;

/// `move` 的最大转向角（度）
pub const MAX_MOVE_TURN_DEGREES: f64 = 720.0;

/// 队列/程序中的一条命令
///
/// 入队后不可变；调度线程执行一次后弹出（无论成功与否）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// 动作标签（`stand`、`sit`、`wait`、`rotate` ...）
    #[serde(rename = "Command")]
    pub action: String,

    /// 动作参数
    #[serde(rename = "Args", default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

impl Command {
    /// 创建不带参数的命令
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: Map::new(),
        }
    }

    /// 追加一个参数
    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn stand() -> Self {
        Self::new("stand")
    }

    pub fn sit() -> Self {
        Self::new("sit")
    }

    /// 暂停调度线程 `seconds` 秒
    pub fn wait(seconds: f64) -> Self {
        Self::new("wait").with_arg("time", seconds)
    }

    /// 旋转到绝对姿态（角度制）
    pub fn rotate(yaw: f64, roll: f64, pitch: f64) -> Self {
        Self::new("rotate")
            .with_arg("yaw", yaw)
            .with_arg("roll", roll)
            .with_arg("pitch", pitch)
    }

    /// 在当前姿态基础上增量旋转（角度制）
    pub fn rotate_by(yaw: f64, roll: f64, pitch: f64) -> Self {
        Self::new("rotate_by")
            .with_arg("yaw", yaw)
            .with_arg("roll", roll)
            .with_arg("pitch", pitch)
    }

    pub fn set_height(height: f64) -> Self {
        Self::new("set_height").with_arg("height", height)
    }

    /// 速度行走：`x`/`y` 为平移，`z` 为转向角（度）
    pub fn move_by(x: f64, y: f64, z: f64) -> Self {
        Self::new("move")
            .with_arg("x", x)
            .with_arg("y", y)
            .with_arg("z", z)
    }

    /// 里程计坐标系下的轨迹目标
    pub fn move_to(x: f64, y: f64, heading: f64) -> Self {
        Self::new("move_to")
            .with_arg("x", x)
            .with_arg("y", y)
            .with_arg("heading", heading)
    }

    pub fn set_locomotion_hint(hint: LocomotionHint) -> Self {
        Self::new("set_locomotion_hint").with_arg("hint", hint.as_str())
    }

    pub fn dance(name: impl Into<String>) -> Self {
        Self::new("dance").with_arg("name", name.into())
    }

    /// 将原始记录解码为强类型动作
    ///
    /// 未知的动作标签不会报错，而是返回 [`Action::Unrecognized`]，
    /// 由调度器决定如何处理（当前为静默忽略）。
    pub fn decode(&self) -> Result<Action, ProtocolError> {
        let action = match self.action.as_str() {
            "stand" => Action::Stand,
            "sit" => Action::Sit,
            "wait" => {
                let seconds = self.bounded("time", MAX_WAIT_SECS)?;
                let duration = Duration::try_from_secs_f64(seconds).map_err(|e| {
                    ProtocolError::InvalidArgument {
                        action: self.action.clone(),
                        arg: "time",
                        reason: e.to_string(),
                    }
                })?;
                Action::Wait(duration)
            },
            "rotate" => Action::Rotate(self.euler()?),
            "rotate_by" => Action::RotateBy(self.euler()?),
            "set_height" => Action::SetHeight(self.number("height")?),
            "move" => Action::Move {
                x: self.bounded("x", MAX_MOVE_DISTANCE)?,
                y: self.bounded("y", MAX_MOVE_DISTANCE)?,
                z: self.bounded("z", MAX_MOVE_TURN_DEGREES)?,
            },
            "move_to" => Action::MoveTo {
                x: self.bounded("x", MAX_MOVE_DISTANCE)?,
                y: self.bounded("y", MAX_MOVE_DISTANCE)?,
                heading: self.number("heading")?,
            },
            "set_locomotion_hint" => Action::SetLocomotionHint(self.text("hint")?.parse()?),
            "dance" => Action::Dance(self.text("name")?),
            other => Action::Unrecognized(other.to_string()),
        };
        Ok(action)
    }

    fn euler(&self) -> Result<EulerDegrees, ProtocolError> {
        Ok(EulerDegrees {
            yaw: self.number("yaw")?,
            roll: self.number("roll")?,
            pitch: self.number("pitch")?,
        })
    }

    fn arg(&self, key: &'static str) -> Result<&Value, ProtocolError> {
        self.args
            .get(key)
            .ok_or_else(|| ProtocolError::MissingArgument {
                action: self.action.clone(),
                arg: key,
            })
    }

    fn number(&self, key: &'static str) -> Result<f64, ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidArgument {
            action: self.action.clone(),
            arg: key,
            reason,
        };

        let value = match self.arg(key)? {
            Value::Number(n) => n.as_f64().ok_or_else(|| invalid(format!("{} is not finite", n)))?,
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| invalid(format!("{:?}: {}", s, e)))?,
            other => return Err(invalid(format!("expected a number, got {}", other))),
        };

        if !value.is_finite() {
            return Err(invalid(format!("{} is not finite", value)));
        }
        Ok(value)
    }

    /// 绝对值不超过 `limit` 的数字参数
    fn bounded(&self, key: &'static str, limit: f64) -> Result<f64, ProtocolError> {
        let value = self.number(key)?;
        if value.abs() > limit {
            return Err(ProtocolError::InvalidArgument {
                action: self.action.clone(),
                arg: key,
                reason: format!("{} is out of range [-{}, {}]", value, limit, limit),
            });
        }
        Ok(value)
    }

    fn text(&self, key: &'static str) -> Result<String, ProtocolError> {
        match self.arg(key)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(ProtocolError::InvalidArgument {
                action: self.action.clone(),
                arg: key,
                reason: format!("expected a string, got {}", other),
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.action)
        } else {
            write!(f, "{} {}", self.action, Value::Object(self.args.clone()))
        }
    }
}

/// 欧拉角（角度制）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EulerDegrees {
    pub yaw: f64,
    pub roll: f64,
    pub pitch: f64,
}

/// 解码后的命令动作
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Stand,
    Sit,
    /// 阻塞调度线程指定时长
    Wait(Duration),
    /// 绝对姿态
    Rotate(EulerDegrees),
    /// 增量姿态（按键盘旋转速度缩放）
    RotateBy(EulerDegrees),
    SetHeight(f64),
    /// 速度行走（相对、连续）
    Move { x: f64, y: f64, z: f64 },
    /// 轨迹目标（里程计坐标系下的绝对位置）
    MoveTo { x: f64, y: f64, heading: f64 },
    SetLocomotionHint(LocomotionHint),
    Dance(String),
    /// 未知动作标签
    Unrecognized(String),
}

/// 步态提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocomotionHint {
    #[default]
    Auto,
    Trot,
    SpeedSelectTrot,
    Crawl,
    SpeedSelectCrawl,
    Amble,
    SpeedSelectAmble,
    Jog,
    Hop,
}

impl LocomotionHint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Trot => "trot",
            Self::SpeedSelectTrot => "speed_select_trot",
            Self::Crawl => "crawl",
            Self::SpeedSelectCrawl => "speed_select_crawl",
            Self::Amble => "amble",
            Self::SpeedSelectAmble => "speed_select_amble",
            Self::Jog => "jog",
            Self::Hop => "hop",
        }
    }
}

impl FromStr for LocomotionHint {
    type Err = ProtocolError;

    /// 大小写不敏感，兼容 SDK 常量写法（如 `HINT_TROT`）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized.strip_prefix("hint_").unwrap_or(&normalized);
        let hint = match normalized {
            "auto" => Self::Auto,
            "trot" => Self::Trot,
            "speed_select_trot" => Self::SpeedSelectTrot,
            "crawl" => Self::Crawl,
            "speed_select_crawl" => Self::SpeedSelectCrawl,
            "amble" => Self::Amble,
            "speed_select_amble" => Self::SpeedSelectAmble,
            "jog" => Self::Jog,
            "hop" => Self::Hop,
            _ => return Err(ProtocolError::UnknownLocomotionHint(s.to_string())),
        };
        Ok(hint)
    }
}
