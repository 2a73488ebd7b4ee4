//! 键盘控制仲裁
//!
//! 同一时刻只有一个客户端拥有键盘控制权。客户端每帧发送按键边沿
//! （按下集合与抬起集合），服务端按固定优先级映射为一个动作：
//!
//! | 优先级 | 条件 | 动作 |
//! |---|---|---|
//! | 1 | `space` 抬起 | 切换 Walk / Stand 模式并站立 |
//! | 2 | `x` 按下 | 侧躺（换电池姿态） |
//! | 3 | `z` 按下 | 自行翻正 |
//! | 4 | `r` 按下 | 重置姿态并站立 |
//! | 5 | `f` 按下 | 坐下 |
//! | 6 | 其他 | `w/s`、`a/d`、`q/e` 差分，按模式行走或调整姿态 |

use parking_lot::Mutex;
use serde::Serialize;
use spot_robot::EulerZxy;

use crate::config::KeyboardConfig;
use crate::control::MotionControl;
use crate::error::SessionError;
use crate::notify::ClientId;

/// 键盘控制模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControlMode {
    #[default]
    Walk,
    Stand,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Walk => "Walk",
            Self::Stand => "Stand",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Walk => Self::Stand,
            Self::Stand => Self::Walk,
        }
    }
}

/// 一帧按键边沿
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyFrame {
    pub keys_down: Vec<String>,
    pub keys_up: Vec<String>,
}

impl KeyFrame {
    pub fn new(keys_down: Vec<String>, keys_up: Vec<String>) -> Self {
        Self { keys_down, keys_up }
    }

    pub fn key_down(&self, key: &str) -> bool {
        self.keys_down.iter().any(|k| k == key)
    }

    pub fn key_up(&self, key: &str) -> bool {
        self.keys_up.iter().any(|k| k == key)
    }

    fn axis(&self, positive: &str, negative: &str) -> f64 {
        f64::from(u8::from(self.key_down(positive))) - f64::from(u8::from(self.key_down(negative)))
    }
}

/// 一帧按键对应的动作
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyboardAction {
    ToggleMode,
    RollOver,
    SelfRight,
    ResetRotation,
    Sit,
    /// Walk 模式：速度行走（单位速度，由运动外观缩放）
    Walk { dx: f64, dy: f64, dz: f64 },
    /// Stand 模式：姿态增量
    Rotate { d_yaw: f64, d_roll: f64, d_pitch: f64 },
}

/// 按优先级把一帧按键映射为动作（先匹配者胜出）
pub fn decide(frame: &KeyFrame, mode: ControlMode) -> KeyboardAction {
    if frame.key_up("space") {
        return KeyboardAction::ToggleMode;
    }
    if frame.key_down("x") {
        return KeyboardAction::RollOver;
    }
    if frame.key_down("z") {
        return KeyboardAction::SelfRight;
    }
    if frame.key_down("r") {
        return KeyboardAction::ResetRotation;
    }
    if frame.key_down("f") {
        return KeyboardAction::Sit;
    }

    let dx = frame.axis("w", "s");
    let dy = frame.axis("a", "d");
    let dz = frame.axis("q", "e");
    match mode {
        ControlMode::Walk => KeyboardAction::Walk {
            dx,
            dy: dy * 0.5,
            dz,
        },
        ControlMode::Stand => KeyboardAction::Rotate {
            d_yaw: dy,
            d_roll: -dz,
            d_pitch: dx,
        },
    }
}

/// 累积的姿态偏移（弧度），每个分量独立限幅
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RotationOffset {
    pub yaw: f64,
    pub roll: f64,
    pub pitch: f64,
}

impl RotationOffset {
    /// 叠加一次增量（按旋转速度缩放）并限幅
    pub fn apply(&mut self, d_yaw: f64, d_roll: f64, d_pitch: f64, config: &KeyboardConfig) -> EulerZxy {
        let step = config.rotation_velocity;
        self.yaw = (self.yaw + d_yaw * step).clamp(-config.yaw_limit, config.yaw_limit);
        self.roll = (self.roll + d_roll * step).clamp(-config.roll_limit, config.roll_limit);
        self.pitch = (self.pitch + d_pitch * step).clamp(-config.pitch_limit, config.pitch_limit);
        self.as_euler()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn as_euler(&self) -> EulerZxy {
        EulerZxy::new(self.yaw, self.roll, self.pitch)
    }
}

#[derive(Debug, Default)]
struct ArbiterState {
    owner: Option<ClientId>,
    mode: ControlMode,
    last_frame: KeyFrame,
}

/// 键盘控制权仲裁器
#[derive(Debug, Default)]
pub struct KeyboardArbiter {
    state: Mutex<ArbiterState>,
}

impl KeyboardArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求控制权：空闲或已是持有者时授予
    pub fn claim(&self, client: ClientId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(client);
                true
            },
            Some(owner) => owner == client,
        }
    }

    /// 释放控制权（仅持有者有效）
    pub fn release(&self, client: ClientId) -> bool {
        let mut state = self.state.lock();
        if state.owner == Some(client) {
            state.owner = None;
            state.last_frame = KeyFrame::default();
            true
        } else {
            false
        }
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.state.lock().owner
    }

    pub fn is_owner(&self, client: ClientId) -> bool {
        self.owner() == Some(client)
    }

    pub fn mode(&self) -> ControlMode {
        self.state.lock().mode
    }

    pub fn last_frame(&self) -> KeyFrame {
        self.state.lock().last_frame.clone()
    }

    /// 记录一帧按键（非持有者的帧被忽略）
    pub fn record(&self, client: ClientId, frame: KeyFrame) -> bool {
        let mut state = self.state.lock();
        if state.owner != Some(client) {
            return false;
        }
        state.last_frame = frame;
        true
    }

    /// 执行最近一帧对应的动作，返回执行后的模式
    pub fn execute(&self, control: &dyn MotionControl) -> Result<ControlMode, SessionError> {
        let (frame, mode) = {
            let state = self.state.lock();
            (state.last_frame.clone(), state.mode)
        };

        match decide(&frame, mode) {
            KeyboardAction::ToggleMode => {
                let mode = {
                    let mut state = self.state.lock();
                    state.mode = state.mode.toggled();
                    state.mode
                };
                control.stand()?;
                return Ok(mode);
            },
            KeyboardAction::RollOver => control.roll_over()?,
            KeyboardAction::SelfRight => control.self_right()?,
            KeyboardAction::ResetRotation => {
                control.reset_rotation();
                control.stand()?;
            },
            KeyboardAction::Sit => control.sit()?,
            KeyboardAction::Walk { dx, dy, dz } => control.keyboard_walk(dx, dy, dz)?,
            KeyboardAction::Rotate {
                d_yaw,
                d_roll,
                d_pitch,
            } => control.keyboard_rotate(d_yaw, d_roll, d_pitch)?,
        }
        Ok(mode)
    }

    /// 复位（释放控制权，模式回到 Walk）
    pub fn reset(&self) {
        *self.state.lock() = ArbiterState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(down: &[&str], up: &[&str]) -> KeyFrame {
        KeyFrame::new(
            down.iter().map(|s| s.to_string()).collect(),
            up.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_priority_roll_over_beats_walk() {
        let action = decide(&frame(&["x", "w"], &[]), ControlMode::Walk);
        assert_eq!(action, KeyboardAction::RollOver);
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(
            decide(&frame(&["x", "z", "r", "f"], &["space"]), ControlMode::Walk),
            KeyboardAction::ToggleMode
        );
        assert_eq!(
            decide(&frame(&["z", "r", "f"], &[]), ControlMode::Walk),
            KeyboardAction::SelfRight
        );
        assert_eq!(
            decide(&frame(&["r", "f"], &[]), ControlMode::Stand),
            KeyboardAction::ResetRotation
        );
        assert_eq!(decide(&frame(&["f", "w"], &[]), ControlMode::Walk), KeyboardAction::Sit);
    }

    #[test]
    fn test_walk_mapping() {
        assert_eq!(
            decide(&frame(&["w", "a", "e"], &[]), ControlMode::Walk),
            KeyboardAction::Walk {
                dx: 1.0,
                dy: 0.5,
                dz: -1.0
            }
        );
        // 相反方向的键互相抵消
        assert_eq!(
            decide(&frame(&["w", "s"], &[]), ControlMode::Walk),
            KeyboardAction::Walk {
                dx: 0.0,
                dy: 0.0,
                dz: 0.0
            }
        );
    }

    #[test]
    fn test_stand_mapping() {
        assert_eq!(
            decide(&frame(&["s", "d", "q"], &[]), ControlMode::Stand),
            KeyboardAction::Rotate {
                d_yaw: -1.0,
                d_roll: -1.0,
                d_pitch: -1.0
            }
        );
    }

    #[test]
    fn test_rotation_offset_clamps() {
        let config = KeyboardConfig::default();
        let mut offset = RotationOffset::default();
        for _ in 0..10 {
            offset.apply(1.0, 1.0, -1.0, &config);
        }
        assert_eq!(offset.yaw, config.yaw_limit);
        assert_eq!(offset.roll, config.roll_limit);
        assert_eq!(offset.pitch, -config.pitch_limit);

        offset.reset();
        assert_eq!(offset, RotationOffset::default());
    }

    #[test]
    fn test_single_owner() {
        let arbiter = KeyboardArbiter::new();
        assert!(arbiter.claim(0));
        assert!(arbiter.claim(0));
        assert!(!arbiter.claim(1));
        assert!(!arbiter.release(1));
        assert!(!arbiter.record(1, frame(&["w"], &[])));
        assert!(arbiter.record(0, frame(&["w"], &[])));
        assert_eq!(arbiter.last_frame(), frame(&["w"], &[]));

        assert!(arbiter.release(0));
        assert_eq!(arbiter.owner(), None);
        assert!(arbiter.claim(1));
        assert!(arbiter.is_owner(1));
    }

    proptest! {
        #[test]
        fn test_rotation_offset_stays_bounded(
            deltas in proptest::collection::vec((-1.0f64..=1.0, -1.0f64..=1.0, -1.0f64..=1.0), 0..64)
        ) {
            let config = KeyboardConfig::default();
            let mut offset = RotationOffset::default();
            for (d_yaw, d_roll, d_pitch) in deltas {
                let euler = offset.apply(d_yaw, d_roll, d_pitch, &config);
                prop_assert!(euler.yaw.abs() <= config.yaw_limit);
                prop_assert!(euler.roll.abs() <= config.roll_limit);
                prop_assert!(euler.pitch.abs() <= config.pitch_limit);
            }
        }
    }
}
