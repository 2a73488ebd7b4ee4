//! 运动命令构建器
//!
//! 与厂商 SDK 的 `RobotCommandBuilder` 对应，只覆盖服务端实际使用的命令。
//! 所有角度均为弧度制。

use spot_protocol::LocomotionHint;

/// ZXY 顺序的欧拉角（弧度）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EulerZxy {
    pub yaw: f64,
    pub roll: f64,
    pub pitch: f64,
}

impl EulerZxy {
    pub fn new(yaw: f64, roll: f64, pitch: f64) -> Self {
        Self { yaw, roll, pitch }
    }
}

/// 避障参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleParams {
    /// 与障碍物保持的距离（米）
    pub obstacle_avoidance_padding: f64,
    pub disable_vision_foot_obstacle_avoidance: bool,
    pub disable_vision_body_obstacle_avoidance: bool,
}

impl Default for ObstacleParams {
    fn default() -> Self {
        Self {
            obstacle_avoidance_padding: 0.1,
            disable_vision_foot_obstacle_avoidance: false,
            disable_vision_body_obstacle_avoidance: false,
        }
    }
}

/// 站立/行走命令附带的移动参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MobilityParams {
    /// 相对默认站姿的机身高度偏移（米）
    pub body_height: f64,
    /// 机身相对足端的姿态
    pub footprint_r_body: EulerZxy,
    pub locomotion_hint: LocomotionHint,
    pub obstacle: ObstacleParams,
}

/// 机器人运动命令
#[derive(Debug, Clone, PartialEq)]
pub enum RobotCommand {
    /// 原地站立（可带姿态与高度）
    SynchroStand { params: MobilityParams },
    SynchroSit,
    /// 速度行走（机身坐标系）
    SynchroVelocity {
        v_x: f64,
        v_y: f64,
        v_rot: f64,
        params: MobilityParams,
    },
    /// 摔倒后自行翻正
    SelfRight,
    /// 侧躺（换电池姿态）
    BatteryChangePose,
    /// 里程计坐标系下的轨迹目标
    TrajectoryGoal { x: f64, y: f64, heading: f64 },
    /// 编舞动作
    Choreography { name: String },
}

impl RobotCommand {
    pub fn stand(params: MobilityParams) -> Self {
        Self::SynchroStand { params }
    }

    pub fn sit() -> Self {
        Self::SynchroSit
    }

    pub fn velocity(v_x: f64, v_y: f64, v_rot: f64, params: MobilityParams) -> Self {
        Self::SynchroVelocity {
            v_x,
            v_y,
            v_rot,
            params,
        }
    }

    pub fn self_right() -> Self {
        Self::SelfRight
    }

    pub fn battery_change_pose() -> Self {
        Self::BatteryChangePose
    }

    pub fn trajectory_goal(x: f64, y: f64, heading: f64) -> Self {
        Self::TrajectoryGoal { x, y, heading }
    }

    pub fn choreography(name: impl Into<String>) -> Self {
        Self::Choreography { name: name.into() }
    }

    /// 命令的简短名称（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            Self::SynchroStand { .. } => "stand",
            Self::SynchroSit => "sit",
            Self::SynchroVelocity { .. } => "velocity",
            Self::SelfRight => "self_right",
            Self::BatteryChangePose => "battery_change_pose",
            Self::TrajectoryGoal { .. } => "trajectory_goal",
            Self::Choreography { .. } => "choreography",
        }
    }
}
