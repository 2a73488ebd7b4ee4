//! 运动控制外观
//!
//! [`MotionControl`] 把高层运动意图（站立、行走、姿态调整 ...）翻译为
//! [`RobotCommand`] 并发送给命令服务。队列命令、程序与键盘控制都只通过
//! 这个接口驱动机器人。
//!
//! 行走命令在发送后阻塞调用线程直到命令时长结束，避免连续的运动命令互相覆盖；
//! 键盘行走是例外，它只设置一个很短的失效时间，不阻塞。

use std::f64::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use spot_protocol::LocomotionHint;
use spot_robot::{CommandService, EulerZxy, MobilityParams, ObstacleParams, RobotCommand, SdkError};
use tracing::debug;

use crate::config::KeyboardConfig;
use crate::keyboard::RotationOffset;
use crate::notify::{NotificationBus, Target};

/// 单段行走的最大转向速度（rad/s），超过时拆分为多段
pub const MAX_TURN_RATE: f64 = 1.5;

/// 拆分后每段的时长
const SEGMENT_DURATION: Duration = Duration::from_secs(1);

/// 单次行走最多拆分的段数，超出部分的转向被丢弃
const MAX_WALK_SEGMENTS: usize = 64;

/// 行走时与障碍物保持的距离（米）
const WALK_OBSTACLE_PADDING: f64 = 1.0;

/// 运动控制接口
pub trait MotionControl: Send + Sync {
    fn stand(&self) -> Result<(), SdkError>;
    fn sit(&self) -> Result<(), SdkError>;
    /// 旋转到绝对姿态（弧度）
    fn rotate(&self, rotation: EulerZxy) -> Result<(), SdkError>;
    /// 在累积姿态上叠加增量（按旋转速度缩放并限幅）
    fn keyboard_rotate(&self, d_yaw: f64, d_roll: f64, d_pitch: f64) -> Result<(), SdkError>;
    fn reset_rotation(&self);
    fn set_height(&self, height: f64) -> Result<(), SdkError>;
    /// 速度行走 `duration`，阻塞直到结束
    fn walk(&self, x: f64, y: f64, z: f64, duration: Duration) -> Result<(), SdkError>;
    /// 键盘行走（单位速度，不阻塞）
    fn keyboard_walk(&self, dx: f64, dy: f64, dz: f64) -> Result<(), SdkError>;
    /// 里程计坐标系下的轨迹目标
    fn move_to(&self, x: f64, y: f64, heading: f64) -> Result<(), SdkError>;
    fn set_locomotion_hint(&self, hint: LocomotionHint);
    fn dance(&self, name: &str) -> Result<(), SdkError>;
    /// 坐下、停顿一秒后自行翻正
    fn self_right(&self) -> Result<(), SdkError>;
    /// 侧躺（换电池姿态）
    fn roll_over(&self) -> Result<(), SdkError>;
    /// 设置输出消息的目标
    fn set_target(&self, target: Target);
    /// 最近是否执行过侧躺
    fn is_rolled_over(&self) -> bool;
    /// `rotate_by` 的缩放系数
    fn rotation_velocity(&self) -> f64;
}

#[derive(Debug)]
struct ControlState {
    target: Target,
    rotation: RotationOffset,
    hint: LocomotionHint,
}

/// 基于命令服务的运动控制实现
pub struct SpotControl {
    commands: Arc<dyn CommandService>,
    bus: Arc<NotificationBus>,
    config: KeyboardConfig,
    state: Mutex<ControlState>,
    rolled_over: AtomicBool,
}

impl SpotControl {
    pub fn new(
        commands: Arc<dyn CommandService>,
        bus: Arc<NotificationBus>,
        config: KeyboardConfig,
    ) -> Self {
        Self {
            commands,
            bus,
            config,
            state: Mutex::new(ControlState {
                target: Target::Broadcast,
                rotation: RotationOffset::default(),
                hint: LocomotionHint::default(),
            }),
            rolled_over: AtomicBool::new(false),
        }
    }

    fn target(&self) -> Target {
        self.state.lock().target
    }

    fn params(&self) -> MobilityParams {
        MobilityParams {
            locomotion_hint: self.state.lock().hint,
            ..MobilityParams::default()
        }
    }

    fn walk_params(&self) -> MobilityParams {
        MobilityParams {
            obstacle: ObstacleParams {
                obstacle_avoidance_padding: WALK_OBSTACLE_PADDING,
                ..ObstacleParams::default()
            },
            ..self.params()
        }
    }

    fn send(&self, command: &RobotCommand, end_time: Option<SystemTime>) -> Result<(), SdkError> {
        debug!("Sending {} command", command.name());
        self.commands.robot_command(command, end_time)
    }

    fn send_walk_segment(&self, x: f64, y: f64, z: f64, duration: Duration) -> Result<(), SdkError> {
        let command = RobotCommand::velocity(x, y, z, self.walk_params());
        self.send(&command, Some(SystemTime::now() + duration))?;
        self.bus.info(
            self.target(),
            format!("Walking at ({}, {}, {})m/s for {}s", x, y, z, duration.as_secs_f64()),
        );
        thread::sleep(duration);
        Ok(())
    }
}

/// 把转向速度过大的行走拆分为若干段
///
/// `|z| >= MAX_TURN_RATE` 时拆为 `n = floor(|z| / MAX_TURN_RATE)` 段满速转向
/// （平移速度均分），余下的转向量作为一段纯转向；每段一秒。
pub fn split_walk(x: f64, y: f64, z: f64, duration: Duration) -> Vec<(f64, f64, f64, Duration)> {
    if z.abs() < MAX_TURN_RATE {
        return vec![(x, y, z, duration)];
    }
    let steps = (z.abs() / MAX_TURN_RATE)
        .floor()
        .min(MAX_WALK_SEGMENTS as f64);
    let turn = MAX_TURN_RATE.copysign(z);
    let mut segments: Vec<_> = (0..steps as usize)
        .map(|_| (x / steps, y / steps, turn, SEGMENT_DURATION))
        .collect();
    let remainder = (z.abs() - steps * MAX_TURN_RATE).min(MAX_TURN_RATE);
    if remainder > f64::EPSILON {
        segments.push((0.0, 0.0, remainder.copysign(z), SEGMENT_DURATION));
    }
    segments
}

impl MotionControl for SpotControl {
    fn stand(&self) -> Result<(), SdkError> {
        self.send(&RobotCommand::stand(self.params()), None)
    }

    fn sit(&self) -> Result<(), SdkError> {
        self.send(&RobotCommand::sit(), None)
    }

    fn rotate(&self, rotation: EulerZxy) -> Result<(), SdkError> {
        let params = MobilityParams {
            footprint_r_body: rotation,
            ..self.params()
        };
        self.send(&RobotCommand::stand(params), None)?;
        let degrees = |rad: f64| rad * 180.0 / PI;
        self.bus.info(
            self.target(),
            format!(
                "Rotated to yaw: {:.2}({:.2}°), roll: {:.2}({:.2}°), pitch: {:.2}({:.2}°)",
                rotation.yaw,
                degrees(rotation.yaw),
                rotation.roll,
                degrees(rotation.roll),
                rotation.pitch,
                degrees(rotation.pitch)
            ),
        );
        Ok(())
    }

    fn keyboard_rotate(&self, d_yaw: f64, d_roll: f64, d_pitch: f64) -> Result<(), SdkError> {
        let (rotation, hint) = {
            let mut state = self.state.lock();
            let rotation = state.rotation.apply(d_yaw, d_roll, d_pitch, &self.config);
            (rotation, state.hint)
        };
        let params = MobilityParams {
            footprint_r_body: rotation,
            locomotion_hint: hint,
            ..MobilityParams::default()
        };
        self.send(&RobotCommand::stand(params), None)
    }

    fn reset_rotation(&self) {
        self.state.lock().rotation.reset();
    }

    fn set_height(&self, height: f64) -> Result<(), SdkError> {
        let params = MobilityParams {
            body_height: height,
            ..self.params()
        };
        self.send(&RobotCommand::stand(params), None)?;
        self.bus.info(self.target(), format!("Standing at: {}", height));
        Ok(())
    }

    fn walk(&self, x: f64, y: f64, z: f64, duration: Duration) -> Result<(), SdkError> {
        for (x, y, z, duration) in split_walk(x, y, z, duration) {
            self.send_walk_segment(x, y, z, duration)?;
        }
        Ok(())
    }

    fn keyboard_walk(&self, dx: f64, dy: f64, dz: f64) -> Result<(), SdkError> {
        let command = RobotCommand::velocity(
            dx * self.config.command_velocity,
            dy * self.config.command_velocity,
            dz * self.config.turn_velocity,
            self.walk_params(),
        );
        self.send(
            &command,
            Some(SystemTime::now() + self.config.command_duration()),
        )
    }

    fn move_to(&self, x: f64, y: f64, heading: f64) -> Result<(), SdkError> {
        self.send(&RobotCommand::trajectory_goal(x, y, heading), None)?;
        self.bus.info(
            self.target(),
            format!("Moving to ({}, {}) heading {}", x, y, heading),
        );
        Ok(())
    }

    fn set_locomotion_hint(&self, hint: LocomotionHint) {
        self.state.lock().hint = hint;
        self.bus
            .info(self.target(), format!("Locomotion hint set to {}", hint.as_str()));
    }

    fn dance(&self, name: &str) -> Result<(), SdkError> {
        self.send(&RobotCommand::choreography(name), None)
    }

    fn self_right(&self) -> Result<(), SdkError> {
        self.sit()?;
        thread::sleep(Duration::from_secs(1));
        self.send(&RobotCommand::self_right(), None)?;
        self.rolled_over.store(false, Ordering::Release);
        Ok(())
    }

    fn roll_over(&self) -> Result<(), SdkError> {
        self.send(&RobotCommand::battery_change_pose(), None)?;
        self.rolled_over.store(true, Ordering::Release);
        Ok(())
    }

    fn set_target(&self, target: Target) {
        self.state.lock().target = target;
    }

    fn is_rolled_over(&self) -> bool {
        self.rolled_over.load(Ordering::Acquire)
    }

    fn rotation_velocity(&self) -> f64 {
        self.config.rotation_velocity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_robot::mock::MockRobot;
    use spot_robot::{Credentials, RobotSdk};

    /// 已持有租约的 Mock 与运动控制
    fn setup() -> (MockRobot, SpotControl) {
        let robot = MockRobot::new();
        let conn = robot.connect("mock", &Credentials::default()).unwrap();
        let lease = conn.lease_service().unwrap();
        lease.acquire().unwrap();
        let control = SpotControl::new(
            conn.command_service().unwrap(),
            Arc::new(NotificationBus::default()),
            KeyboardConfig::default(),
        );
        (robot, control)
    }

    #[test]
    fn test_split_walk_small_turn() {
        let segments = split_walk(0.5, 0.0, 1.0, Duration::from_secs(2));
        assert_eq!(segments, vec![(0.5, 0.0, 1.0, Duration::from_secs(2))]);
    }

    #[test]
    fn test_split_walk_large_turn() {
        let segments = split_walk(1.0, 0.5, -3.5, Duration::from_secs(1));
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], (0.5, 0.25, -1.5, SEGMENT_DURATION));
        assert_eq!(segments[1], (0.5, 0.25, -1.5, SEGMENT_DURATION));
        assert_eq!(segments[2].0, 0.0);
        assert!((segments[2].2 + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_split_walk_exact_multiple() {
        let segments = split_walk(0.0, 0.0, 3.0, Duration::from_secs(1));
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.2 == 1.5));
    }

    #[test]
    fn test_split_walk_caps_segment_count() {
        let segments = split_walk(0.0, 0.0, 1e20, Duration::from_secs(1));
        assert_eq!(segments.len(), MAX_WALK_SEGMENTS + 1);
        assert!(segments.iter().all(|s| s.2.abs() <= MAX_TURN_RATE));
    }

    #[test]
    fn test_keyboard_rotate_accumulates() {
        let (robot, control) = setup();
        control.keyboard_rotate(1.0, 0.0, 0.0).unwrap();
        control.keyboard_rotate(1.0, 0.0, 0.0).unwrap();

        let commands = robot.commands();
        let RobotCommand::SynchroStand { params } = commands.last().unwrap() else {
            panic!("expected stand command");
        };
        assert!((params.footprint_r_body.yaw - 0.4).abs() < 1e-9);

        control.reset_rotation();
        control.keyboard_rotate(0.0, 0.0, 0.0).unwrap();
        let RobotCommand::SynchroStand { params } = robot.commands().last().cloned().unwrap() else {
            panic!("expected stand command");
        };
        assert_eq!(params.footprint_r_body, EulerZxy::default());
    }

    #[test]
    fn test_keyboard_walk_scaled() {
        let (robot, control) = setup();
        control.keyboard_walk(1.0, 0.5, -1.0).unwrap();
        let RobotCommand::SynchroVelocity {
            v_x,
            v_y,
            v_rot,
            params,
        } = robot.commands().last().cloned().unwrap()
        else {
            panic!("expected velocity command");
        };
        assert_eq!((v_x, v_y, v_rot), (0.5, 0.25, -0.5));
        assert_eq!(params.obstacle.obstacle_avoidance_padding, WALK_OBSTACLE_PADDING);
    }

    #[test]
    fn test_hint_applies_to_stand() {
        let (robot, control) = setup();
        control.set_locomotion_hint(LocomotionHint::Crawl);
        control.stand().unwrap();
        let RobotCommand::SynchroStand { params } = robot.commands().last().cloned().unwrap() else {
            panic!("expected stand command");
        };
        assert_eq!(params.locomotion_hint, LocomotionHint::Crawl);
    }

    #[test]
    fn test_roll_over_flag() {
        let (robot, control) = setup();
        assert!(!control.is_rolled_over());
        control.roll_over().unwrap();
        assert!(control.is_rolled_over());
        assert_eq!(robot.commands().last().unwrap(), &RobotCommand::BatteryChangePose);
    }

    #[test]
    fn test_commands_without_lease_fail() {
        let robot = MockRobot::new();
        let conn = robot.connect("mock", &Credentials::default()).unwrap();
        let control = SpotControl::new(
            conn.command_service().unwrap(),
            Arc::new(NotificationBus::default()),
            KeyboardConfig::default(),
        );
        let err = control.sit().unwrap_err();
        assert!(err.is(spot_robot::SdkErrorKind::NoSuchLease));
    }
}
